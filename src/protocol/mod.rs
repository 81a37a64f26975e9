//! # Connection Protocol
//!
//! Certificate-authenticated handshake between a provisioned master and
//! the coordinator, producing a live [`Channel`] or a [`Refusal`].
//!
//! Trust is established by rustls before any frame is exchanged: both
//! sides present certificates chained to the fleet CA. The declared
//! organization is then cross-checked against the certificate's `O=`
//! attribute, or against the identity pinned for the master.

mod agent;
mod channel;
mod engine;
mod errors;
mod frame;
mod identity;
mod issuer;
mod listener;
mod tls;

pub use agent::{AgentConfig, AgentHandle, AgentStatus, MasterAgent};
pub use channel::Channel;
pub use engine::{HandshakeOutcome, ProtocolEngine, DEFAULT_HANDSHAKE_TIMEOUT};
pub use errors::{ConnectError, ConnectionFailure, ProtocolError, ProtocolResult, SecurityError};
pub use frame::{read_frame, write_frame, Frame, MAX_FRAME_SIZE, PROTOCOL_VERSION};
pub use identity::{fingerprint, PeerIdentity};
pub use issuer::{IdentityIssuer, IssuedIdentity, CA_CERT_FILE, CA_KEY_FILE};
pub use listener::{AgentListener, AttemptCanceller, ConnectionAttempt, Refusal, RefusalReason};
pub use tls::{server_name, TlsConfig, TlsConfigBuilder};
