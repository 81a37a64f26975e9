//! Master Lifecycle State Machine
//!
//! ```text
//! Created -> Provisioning -> Provisioned -> Approved -> Terminating -> Terminated
//!                 |               ^              |
//!                 |               +--disconnect--+
//!                 v
//!        ProvisioningFailed --reset--> Created
//! ```
//!
//! - States are explicit and enumerable
//! - Every transition consumes the current state and either yields the next
//!   state or a `ForbiddenTransition` error
//! - Termination is accepted from every non-terminal state, and from
//!   `ProvisioningFailed` so failed entities can be cleaned up

use serde::{Deserialize, Serialize};

use super::errors::{MasterError, MasterResult};

/// Lifecycle state of one tenant master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MasterState {
    /// Record exists; nothing has been dispatched yet.
    Created,

    /// A start request is in flight on a backend (or waiting for a retry).
    Provisioning,

    /// The backend reports the instance as running and reachable.
    /// No secure channel exists yet.
    Provisioned,

    /// The instance completed the handshake and holds a live channel.
    Approved,

    /// Teardown accepted; waiting for backend confirmation.
    Terminating,

    /// Instance is gone. Terminal.
    Terminated,

    /// Start retries exhausted. Terminal until explicitly reset.
    ProvisioningFailed,
}

impl Default for MasterState {
    fn default() -> Self {
        Self::Created
    }
}

impl MasterState {
    /// Get the state name for observability.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Provisioning => "Provisioning",
            Self::Provisioned => "Provisioned",
            Self::Approved => "Approved",
            Self::Terminating => "Terminating",
            Self::Terminated => "Terminated",
            Self::ProvisioningFailed => "ProvisioningFailed",
        }
    }

    /// Terminal states never leave on their own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated | Self::ProvisioningFailed)
    }

    /// States counted as "provisioned": an instance exists and has not been
    /// confirmed gone.
    pub fn is_provisioned(&self) -> bool {
        matches!(self, Self::Provisioned | Self::Approved | Self::Terminating)
    }

    /// Only these states may carry a live channel.
    pub fn allows_channel(&self) -> bool {
        matches!(self, Self::Approved)
    }

    /// Created -> Provisioning
    pub fn begin_provisioning(self) -> MasterResult<Self> {
        match self {
            Self::Created => Ok(Self::Provisioning),
            _ => Err(MasterError::forbidden_transition(self.as_str(), "Provisioning")),
        }
    }

    /// Provisioning -> Provisioned
    pub fn mark_provisioned(self) -> MasterResult<Self> {
        match self {
            Self::Provisioning => Ok(Self::Provisioned),
            _ => Err(MasterError::forbidden_transition(self.as_str(), "Provisioned")),
        }
    }

    /// Provisioned -> Approved
    pub fn approve(self) -> MasterResult<Self> {
        match self {
            Self::Provisioned => Ok(Self::Approved),
            _ => Err(MasterError::forbidden_transition(self.as_str(), "Approved")),
        }
    }

    /// Provisioning -> ProvisioningFailed
    pub fn fail_provisioning(self) -> MasterResult<Self> {
        match self {
            Self::Provisioning => Ok(Self::ProvisioningFailed),
            _ => Err(MasterError::forbidden_transition(
                self.as_str(),
                "ProvisioningFailed",
            )),
        }
    }

    /// Approved -> Provisioned
    ///
    /// The channel was lost; the instance is still running and may dial
    /// back in.
    pub fn disconnect(self) -> MasterResult<Self> {
        match self {
            Self::Approved => Ok(Self::Provisioned),
            _ => Err(MasterError::forbidden_transition(self.as_str(), "Provisioned")),
        }
    }

    /// ProvisioningFailed -> Created
    pub fn reset(self) -> MasterResult<Self> {
        match self {
            Self::ProvisioningFailed => Ok(Self::Created),
            _ => Err(MasterError::forbidden_transition(self.as_str(), "Created")),
        }
    }

    /// {Created, Provisioning, Provisioned, Approved, ProvisioningFailed} -> Terminating
    pub fn begin_terminating(self) -> MasterResult<Self> {
        match self {
            Self::Created
            | Self::Provisioning
            | Self::Provisioned
            | Self::Approved
            | Self::ProvisioningFailed => Ok(Self::Terminating),
            _ => Err(MasterError::forbidden_transition(self.as_str(), "Terminating")),
        }
    }

    /// Terminating -> Terminated
    pub fn mark_terminated(self) -> MasterResult<Self> {
        match self {
            Self::Terminating => Ok(Self::Terminated),
            _ => Err(MasterError::forbidden_transition(self.as_str(), "Terminated")),
        }
    }
}

impl std::fmt::Display for MasterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
