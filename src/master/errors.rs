//! # Master Errors

use thiserror::Error;

/// Result type for master entity operations
pub type MasterResult<T> = Result<T, MasterError>;

/// Master entity errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MasterError {
    #[error("Unknown organization: {0}")]
    NotFound(String),

    #[error("Master already exists for organization: {0}")]
    AlreadyExists(String),

    #[error("Invalid organization name: {0:?}")]
    InvalidOrganization(String),

    #[error("Forbidden transition: {from} -> {to}")]
    ForbiddenTransition {
        from: &'static str,
        to: &'static str,
    },

    #[error("Provisioner is not running")]
    ProvisionerStopped,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MasterError {
    /// Create a forbidden transition error.
    pub fn forbidden_transition(from: &'static str, to: &'static str) -> Self {
        Self::ForbiddenTransition { from, to }
    }

    /// Error for a poisoned entity or registry lock.
    pub fn poisoned() -> Self {
        Self::Internal("Lock poisoned".into())
    }

    /// Get HTTP status code
    pub fn status_code(&self) -> u16 {
        match self {
            MasterError::NotFound(_) => 404,
            MasterError::AlreadyExists(_) => 409,
            MasterError::InvalidOrganization(_) => 400,
            MasterError::ForbiddenTransition { .. } => 409,
            MasterError::ProvisionerStopped => 503,
            MasterError::Internal(_) => 500,
        }
    }
}
