//! Lifecycle and connection events
//!
//! One tagged type covers everything an observer can see. Observers match
//! on the variants they care about and ignore the rest.

use std::collections::BTreeMap;

use serde::Serialize;
use uuid::Uuid;

use crate::backend::InstanceHandle;
use crate::master::Organization;
use crate::protocol::{PeerIdentity, Refusal};

/// Transitions of a master entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MasterEvent {
    /// A master record was created.
    Created { organization: Organization, id: Uuid },

    /// Created -> Provisioning: a start was dispatched to `backend`.
    Provisioning {
        organization: Organization,
        backend: String,
    },

    /// Provisioning -> Provisioned: the instance is up and reachable.
    Provisioned {
        organization: Organization,
        endpoint: String,
        handle: InstanceHandle,
    },

    /// Provisioned -> Approved: handshake completed, channel attached.
    Approved {
        organization: Organization,
        channel_id: Uuid,
        fingerprint: String,
    },

    /// Provisioning -> ProvisioningFailed: retries exhausted.
    ProvisioningFailed {
        organization: Organization,
        backend: Option<String>,
        error: String,
        attempts: u32,
    },

    /// Approved -> Provisioned: the channel was lost.
    Disconnected {
        organization: Organization,
        channel_id: Uuid,
    },

    /// -> Terminating
    Terminating {
        organization: Organization,
        forced: bool,
    },

    /// Terminating -> Terminated
    Terminated { organization: Organization },
}

impl MasterEvent {
    pub fn organization(&self) -> &Organization {
        match self {
            Self::Created { organization, .. }
            | Self::Provisioning { organization, .. }
            | Self::Provisioned { organization, .. }
            | Self::Approved { organization, .. }
            | Self::ProvisioningFailed { organization, .. }
            | Self::Disconnected { organization, .. }
            | Self::Terminating { organization, .. }
            | Self::Terminated { organization } => organization,
        }
    }

    /// Get the event name for logging/metrics.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Created { .. } => "master.created",
            Self::Provisioning { .. } => "master.provisioning",
            Self::Provisioned { .. } => "master.provisioned",
            Self::Approved { .. } => "master.approved",
            Self::ProvisioningFailed { .. } => "master.provisioning_failed",
            Self::Disconnected { .. } => "master.disconnected",
            Self::Terminating { .. } => "master.terminating",
            Self::Terminated { .. } => "master.terminated",
        }
    }
}

/// Progress of one connection attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConnectionEvent {
    /// Peer certificate verified and handshake declared; trust not yet
    /// granted.
    ConnectingTo {
        attempt_id: Uuid,
        address: String,
        identity: PeerIdentity,
        organization: Organization,
        properties: BTreeMap<String, String>,
    },

    /// Live channel established and identity accepted.
    ConnectedTo {
        attempt_id: Uuid,
        channel_id: Uuid,
        identity: PeerIdentity,
        organization: Organization,
    },

    /// A policy decision declined the attempt.
    Refusal(Refusal),

    /// The attempt failed on a fault.
    Error {
        attempt_id: Option<Uuid>,
        organization: Option<Organization>,
        address: String,
        security: bool,
        message: String,
    },
}

impl ConnectionEvent {
    pub fn organization(&self) -> Option<&Organization> {
        match self {
            Self::ConnectingTo { organization, .. } | Self::ConnectedTo { organization, .. } => {
                Some(organization)
            }
            Self::Refusal(refusal) => refusal.organization.as_ref(),
            Self::Error { organization, .. } => organization.as_ref(),
        }
    }

    /// Get the event name for logging/metrics.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::ConnectingTo { .. } => "connection.connecting_to",
            Self::ConnectedTo { .. } => "connection.connected_to",
            Self::Refusal(_) => "connection.refusal",
            Self::Error { .. } => "connection.error",
        }
    }
}

/// Anything delivered through the [`ListenerRegistry`](super::ListenerRegistry).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Master(MasterEvent),
    Connection(ConnectionEvent),
}

impl LifecycleEvent {
    pub fn organization(&self) -> Option<&Organization> {
        match self {
            Self::Master(e) => Some(e.organization()),
            Self::Connection(e) => e.organization(),
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Master(e) => e.event_name(),
            Self::Connection(e) => e.event_name(),
        }
    }
}

impl From<MasterEvent> for LifecycleEvent {
    fn from(event: MasterEvent) -> Self {
        Self::Master(event)
    }
}

impl From<ConnectionEvent> for LifecycleEvent {
    fn from(event: ConnectionEvent) -> Self {
        Self::Connection(event)
    }
}
