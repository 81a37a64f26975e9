//! # Connection Attempts and Agent Listeners
//!
//! An [`AgentListener`] decides, per side of the handshake, whether an
//! attempt may proceed. Policy outcomes are [`Refusal`]s; faults are
//! reported through `on_error`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use super::channel::Channel;
use super::errors::{ConnectError, ConnectionFailure, SecurityError};
use super::identity::PeerIdentity;
use crate::master::Organization;

/// Why an attempt was declined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum RefusalReason {
    /// No master is recorded for the organization.
    UnknownOrganization,
    /// The master is still being provisioned.
    NotYetProvisioned,
    /// The master is in a state that takes no connections.
    NotAccepting { state: String },
    /// The organization already has a live channel or an attempt in flight.
    DuplicateConnection,
    /// Too many masters are connected.
    QuotaExceeded { limit: usize },
    /// The attempt was cancelled, e.g. by forced termination.
    Cancelled,
    /// The peer speaks a protocol version we do not.
    UnsupportedVersion { theirs: u32 },
    /// Peer-specific reason.
    Other { message: String },
}

impl fmt::Display for RefusalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefusalReason::UnknownOrganization => write!(f, "unknown organization"),
            RefusalReason::NotYetProvisioned => write!(f, "master not yet provisioned"),
            RefusalReason::NotAccepting { state } => {
                write!(f, "master is {state} and accepts no connections")
            }
            RefusalReason::DuplicateConnection => {
                write!(f, "organization already connected or connecting")
            }
            RefusalReason::QuotaExceeded { limit } => {
                write!(f, "connected master quota of {limit} exceeded")
            }
            RefusalReason::Cancelled => write!(f, "attempt cancelled"),
            RefusalReason::UnsupportedVersion { theirs } => {
                write!(f, "unsupported protocol version {theirs}")
            }
            RefusalReason::Other { message } => write!(f, "{message}"),
        }
    }
}

/// A declined attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Refusal {
    pub attempt_id: Option<Uuid>,
    pub organization: Option<Organization>,
    pub reason: RefusalReason,
    /// `true` when the other side declined.
    pub remote: bool,
}

impl Refusal {
    pub fn local(
        attempt_id: Option<Uuid>,
        organization: Option<Organization>,
        reason: RefusalReason,
    ) -> Self {
        Self {
            attempt_id,
            organization,
            reason,
            remote: false,
        }
    }

    pub fn remote(
        attempt_id: Option<Uuid>,
        organization: Option<Organization>,
        reason: RefusalReason,
    ) -> Self {
        Self {
            attempt_id,
            organization,
            reason,
            remote: true,
        }
    }
}

/// Cancels one connection attempt from outside the handshake.
#[derive(Clone)]
pub struct AttemptCanceller {
    attempt_id: Uuid,
    tx: Arc<watch::Sender<bool>>,
}

impl fmt::Debug for AttemptCanceller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttemptCanceller")
            .field("attempt_id", &self.attempt_id)
            .field("cancelled", &*self.tx.borrow())
            .finish()
    }
}

impl AttemptCanceller {
    pub fn attempt_id(&self) -> Uuid {
        self.attempt_id
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// One handshake in progress.
#[derive(Debug, Clone)]
pub struct ConnectionAttempt {
    pub id: Uuid,
    /// Remote address of the peer.
    pub address: String,
    /// Verified certificate identity of the peer.
    pub identity: PeerIdentity,
    /// Organization the peer declared.
    pub organization: Organization,
    pub properties: BTreeMap<String, String>,
    pub started_at: DateTime<Utc>,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
}

impl ConnectionAttempt {
    pub fn new(
        address: impl Into<String>,
        identity: PeerIdentity,
        organization: Organization,
        properties: BTreeMap<String, String>,
    ) -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            id: Uuid::new_v4(),
            address: address.into(),
            identity,
            organization,
            properties,
            started_at: Utc::now(),
            cancel_tx: Arc::new(tx),
            cancel_rx: rx,
        }
    }

    /// Handle that cancels this attempt.
    pub fn canceller(&self) -> AttemptCanceller {
        AttemptCanceller {
            attempt_id: self.id,
            tx: self.cancel_tx.clone(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    /// Resolves once the attempt is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel_rx.clone();
        // The sender lives in `self`, so this only ends on cancellation.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Cross-check the declared organization against the one bound in the
    /// certificate, when the certificate binds one.
    pub fn verify_organization_claim(&self) -> Result<(), SecurityError> {
        match &self.identity.organization {
            Some(certified) if certified != self.organization.as_str() => {
                Err(SecurityError::OrganizationMismatch {
                    declared: self.organization.to_string(),
                    certified: certified.clone(),
                })
            }
            _ => Ok(()),
        }
    }
}

/// Per-side policy for connection attempts.
///
/// Called on the handshake task; implementations must not block.
pub trait AgentListener: Send + Sync {
    /// The peer is verified at the TLS level and has declared itself.
    /// Returning an error aborts the attempt.
    fn on_connecting_to(&self, attempt: &ConnectionAttempt) -> Result<(), ConnectError>;

    /// A live channel exists. Returning an error closes it again.
    fn on_connected_to(
        &self,
        attempt: &ConnectionAttempt,
        channel: &Channel,
    ) -> Result<(), ConnectError>;

    /// The attempt was declined by either side.
    fn on_refusal(&self, _refusal: &Refusal) {}

    /// The attempt failed on a fault. `attempt_id` and `organization` are
    /// known once the peer has declared itself.
    fn on_error(
        &self,
        _attempt_id: Option<Uuid>,
        _organization: Option<&Organization>,
        _failure: &ConnectionFailure,
    ) {
    }
}
