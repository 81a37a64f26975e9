//! # Protocol Engine
//!
//! Runs the handshake for one connection attempt on either side:
//!
//! ```text
//! initiator (master)                         acceptor (coordinator)
//!   ── mutual TLS, chain verified ──────────────────────────────────
//!   Hello{version, organization, properties} ──▶
//!                                              on_connecting_to
//!                          ◀── Welcome{organization, properties}
//!   on_connecting_to
//!   Confirm ──▶
//!                                              open channel, on_connected_to
//!                                   ◀── Ready{channel_id}
//!   open channel, on_connected_to
//! ```
//!
//! Either side may answer with `Refused{reason}` (policy) or
//! `Failed{message}` (fault) instead of the next step. Every attempt ends
//! in exactly one [`HandshakeOutcome`], which is reported to the agent
//! listener and the event registry.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::channel::Channel;
use super::errors::{ConnectError, ConnectionFailure, ProtocolError, SecurityError};
use super::frame::{read_frame, write_frame, Frame, PROTOCOL_VERSION};
use super::identity::PeerIdentity;
use super::listener::{AgentListener, ConnectionAttempt, Refusal, RefusalReason};
use super::tls::{server_name, TlsConfig};
use crate::events::{ConnectionEvent, ListenerRegistry};
use crate::master::Organization;

/// Default bound on one handshake, TLS included.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How an attempt ended.
#[derive(Debug)]
pub enum HandshakeOutcome {
    Connected {
        attempt: ConnectionAttempt,
        channel: Channel,
    },
    Refused(Refusal),
    Errored(ConnectionFailure),
}

impl HandshakeOutcome {
    pub fn channel(&self) -> Option<&Channel> {
        match self {
            HandshakeOutcome::Connected { channel, .. } => Some(channel),
            _ => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, HandshakeOutcome::Connected { .. })
    }

    pub fn is_refused(&self) -> bool {
        matches!(self, HandshakeOutcome::Refused(_))
    }
}

enum Stop {
    Refused { reason: RefusalReason, remote: bool },
    Failed(ConnectionFailure),
}

impl From<ProtocolError> for Stop {
    fn from(err: ProtocolError) -> Self {
        Stop::Failed(err.into())
    }
}

impl From<SecurityError> for Stop {
    fn from(err: SecurityError) -> Self {
        Stop::Failed(err.into())
    }
}

/// What is known about an attempt so far, for reporting.
#[derive(Default)]
struct Progress {
    attempt_id: Option<Uuid>,
    organization: Option<Organization>,
}

impl Progress {
    fn track(&mut self, attempt: &ConnectionAttempt) {
        self.attempt_id = Some(attempt.id);
        self.organization = Some(attempt.organization.clone());
    }
}

/// One side of the agent protocol.
pub struct ProtocolEngine {
    tls: TlsConfig,
    organization: Organization,
    properties: BTreeMap<String, String>,
    listener: Arc<dyn AgentListener>,
    events: Arc<ListenerRegistry>,
    handshake_timeout: Duration,
}

impl std::fmt::Debug for ProtocolEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolEngine")
            .field("organization", &self.organization)
            .field("handshake_timeout", &self.handshake_timeout)
            .finish_non_exhaustive()
    }
}

impl ProtocolEngine {
    /// `organization` and `properties` are what this side declares.
    pub fn new(
        tls: TlsConfig,
        organization: Organization,
        listener: Arc<dyn AgentListener>,
        events: Arc<ListenerRegistry>,
    ) -> Self {
        Self {
            tls,
            organization,
            properties: BTreeMap::new(),
            listener,
            events,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_properties(mut self, properties: BTreeMap<String, String>) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn organization(&self) -> &Organization {
        &self.organization
    }

    // =========================================================================
    // ACCEPTOR
    // =========================================================================

    /// Accept connections until `shutdown` flips to `true`. Each
    /// connection is handled on its own task.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        let local = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        info!(address = %local, "agent endpoint listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((tcp, remote)) => {
                        let engine = self.clone();
                        tokio::spawn(async move {
                            let outcome = engine.accept(tcp, remote).await;
                            debug!(%remote, connected = outcome.is_connected(), "agent attempt finished");
                        });
                    }
                    Err(e) => warn!(error = %e, "failed to accept agent connection"),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(address = %local, "agent endpoint stopped");
    }

    /// Run the acceptor side of the handshake on an inbound connection.
    pub async fn accept(&self, tcp: TcpStream, remote: SocketAddr) -> HandshakeOutcome {
        let address = remote.to_string();
        let mut progress = Progress::default();
        let result = match tokio::time::timeout(
            self.handshake_timeout,
            self.accept_inner(tcp, &address, &mut progress),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ProtocolError::Timeout("agent handshake".into()).into()),
        };
        self.finish(&address, progress, result)
    }

    async fn accept_inner(
        &self,
        tcp: TcpStream,
        address: &str,
        progress: &mut Progress,
    ) -> Result<(ConnectionAttempt, Channel), Stop> {
        let mut tls = self
            .tls
            .acceptor()
            .accept(tcp)
            .await
            .map_err(classify_tls_error)?;
        let identity = PeerIdentity::from_peer_certificates(tls.get_ref().1.peer_certificates())?;

        let (organization, properties) = match read_frame(&mut tls).await? {
            Frame::Hello {
                protocol_version,
                organization,
                properties,
            } => {
                if protocol_version != PROTOCOL_VERSION {
                    let reason = RefusalReason::UnsupportedVersion {
                        theirs: protocol_version,
                    };
                    progress.organization = Some(organization);
                    return Err(refuse(&mut tls, reason).await);
                }
                (organization, properties)
            }
            other => return Err(unexpected(&mut tls, "hello", &other).await),
        };

        let attempt = ConnectionAttempt::new(address, identity, organization, properties);
        progress.track(&attempt);
        self.fire_connecting(&attempt);
        if let Err(e) = self.listener.on_connecting_to(&attempt) {
            return Err(reject(&mut tls, e).await);
        }

        write_frame(
            &mut tls,
            &Frame::Welcome {
                organization: self.organization.clone(),
                properties: self.properties.clone(),
            },
        )
        .await?;

        let reply = tokio::select! {
            frame = read_frame(&mut tls) => frame?,
            _ = attempt.cancelled() => return Err(refuse(&mut tls, RefusalReason::Cancelled).await),
        };
        match reply {
            Frame::Confirm => {}
            other => return Err(remote_stop(other, "confirm")),
        }
        if attempt.is_cancelled() {
            return Err(refuse(&mut tls, RefusalReason::Cancelled).await);
        }

        let channel_id = Uuid::new_v4();
        let channel = Channel::spawn(
            tls,
            channel_id,
            attempt.organization.clone(),
            attempt.identity.clone(),
            address,
        );
        if let Err(e) = self.listener.on_connected_to(&attempt, &channel) {
            let stop = stop_for(&e);
            let _ = channel.send_frame(reply_for(&e));
            channel.close(e.to_string());
            return Err(stop);
        }
        if let Err(e) = channel.send_frame(Frame::Ready { channel_id }) {
            channel.close("failed to confirm channel");
            return Err(e.into());
        }
        Ok((attempt, channel))
    }

    // =========================================================================
    // INITIATOR
    // =========================================================================

    /// Dial `address` and run the initiator side of the handshake.
    /// `name` is the DNS name the acceptor's certificate must carry.
    pub async fn connect(&self, address: &str, name: &str) -> HandshakeOutcome {
        let mut progress = Progress::default();
        let result = match tokio::time::timeout(
            self.handshake_timeout,
            self.connect_inner(address, name, &mut progress),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ProtocolError::Timeout("agent handshake".into()).into()),
        };
        self.finish(address, progress, result)
    }

    async fn connect_inner(
        &self,
        address: &str,
        name: &str,
        progress: &mut Progress,
    ) -> Result<(ConnectionAttempt, Channel), Stop> {
        let server_name = server_name(name)?;
        let tcp = TcpStream::connect(address).await.map_err(ProtocolError::from)?;
        let mut tls = self
            .tls
            .connector()
            .connect(server_name, tcp)
            .await
            .map_err(classify_tls_error)?;
        let identity = PeerIdentity::from_peer_certificates(tls.get_ref().1.peer_certificates())?;

        write_frame(
            &mut tls,
            &Frame::Hello {
                protocol_version: PROTOCOL_VERSION,
                organization: self.organization.clone(),
                properties: self.properties.clone(),
            },
        )
        .await?;

        let attempt = match read_frame(&mut tls).await? {
            Frame::Welcome {
                organization,
                properties,
            } => ConnectionAttempt::new(address, identity, organization, properties),
            other => return Err(remote_stop(other, "welcome")),
        };
        progress.track(&attempt);
        self.fire_connecting(&attempt);
        if let Err(e) = self.listener.on_connecting_to(&attempt) {
            return Err(reject(&mut tls, e).await);
        }
        write_frame(&mut tls, &Frame::Confirm).await?;

        let channel_id = match read_frame(&mut tls).await? {
            Frame::Ready { channel_id } => channel_id,
            other => return Err(remote_stop(other, "ready")),
        };
        let channel = Channel::spawn(
            tls,
            channel_id,
            attempt.organization.clone(),
            attempt.identity.clone(),
            address,
        );
        if let Err(e) = self.listener.on_connected_to(&attempt, &channel) {
            channel.close(e.to_string());
            return Err(stop_for(&e));
        }
        Ok((attempt, channel))
    }

    // =========================================================================
    // REPORTING
    // =========================================================================

    fn fire_connecting(&self, attempt: &ConnectionAttempt) {
        self.events.fire(ConnectionEvent::ConnectingTo {
            attempt_id: attempt.id,
            address: attempt.address.clone(),
            identity: attempt.identity.clone(),
            organization: attempt.organization.clone(),
            properties: attempt.properties.clone(),
        });
    }

    fn finish(
        &self,
        address: &str,
        progress: Progress,
        result: Result<(ConnectionAttempt, Channel), Stop>,
    ) -> HandshakeOutcome {
        match result {
            Ok((attempt, channel)) => {
                self.events.fire(ConnectionEvent::ConnectedTo {
                    attempt_id: attempt.id,
                    channel_id: channel.id(),
                    identity: attempt.identity.clone(),
                    organization: attempt.organization.clone(),
                });
                HandshakeOutcome::Connected { attempt, channel }
            }
            Err(Stop::Refused { reason, remote }) => {
                let refusal = Refusal {
                    attempt_id: progress.attempt_id,
                    organization: progress.organization,
                    reason,
                    remote,
                };
                self.listener.on_refusal(&refusal);
                self.events.fire(ConnectionEvent::Refusal(refusal.clone()));
                HandshakeOutcome::Refused(refusal)
            }
            Err(Stop::Failed(failure)) => {
                self.listener
                    .on_error(progress.attempt_id, progress.organization.as_ref(), &failure);
                self.events.fire(ConnectionEvent::Error {
                    attempt_id: progress.attempt_id,
                    organization: progress.organization,
                    address: address.to_string(),
                    security: failure.is_security(),
                    message: failure.to_string(),
                });
                HandshakeOutcome::Errored(failure)
            }
        }
    }
}

fn stop_for(err: &ConnectError) -> Stop {
    match err {
        ConnectError::Refused(reason) => Stop::Refused {
            reason: reason.clone(),
            remote: false,
        },
        ConnectError::Security(e) => Stop::Failed(e.clone().into()),
        ConnectError::Io(message) => Stop::Failed(ProtocolError::Io(message.clone()).into()),
    }
}

fn reply_for(err: &ConnectError) -> Frame {
    match err {
        ConnectError::Refused(reason) => Frame::Refused {
            reason: reason.clone(),
        },
        other => Frame::Failed {
            message: other.to_string(),
        },
    }
}

/// Tell the peer a listener stopped the attempt, and why.
async fn reject<S>(stream: &mut S, err: ConnectError) -> Stop
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let _ = write_frame(stream, &reply_for(&err)).await;
    stop_for(&err)
}

async fn refuse<S>(stream: &mut S, reason: RefusalReason) -> Stop
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    reject(stream, ConnectError::Refused(reason)).await
}

async fn unexpected<S>(stream: &mut S, expected: &'static str, got: &Frame) -> Stop
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let err = ProtocolError::UnexpectedFrame {
        expected,
        got: got.kind(),
    };
    let _ = write_frame(
        stream,
        &Frame::Failed {
            message: err.to_string(),
        },
    )
    .await;
    err.into()
}

/// The peer answered with something other than the next step.
fn remote_stop(frame: Frame, expected: &'static str) -> Stop {
    match frame {
        Frame::Refused { reason } => Stop::Refused {
            reason,
            remote: true,
        },
        Frame::Failed { message } => ProtocolError::Remote(message).into(),
        other => ProtocolError::UnexpectedFrame {
            expected,
            got: other.kind(),
        }
        .into(),
    }
}

fn classify_tls_error(err: std::io::Error) -> Stop {
    let tls = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>());
    match tls {
        Some(rustls::Error::InvalidCertificate(e)) => {
            SecurityError::InvalidCertificate(format!("{e:?}")).into()
        }
        Some(rustls::Error::NoCertificatesPresented) => SecurityError::MissingCertificate.into(),
        Some(e) => ProtocolError::Handshake(e.to_string()).into(),
        None => ProtocolError::from(err).into(),
    }
}
