//! # Scheduler Errors

use thiserror::Error;

use crate::master::MasterError;

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Scheduler errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Scheduler is stopped")]
    Stopped,

    #[error("No provisioning backends registered")]
    NoBackends,

    #[error("Duplicate backend name: {0}")]
    DuplicateBackend(String),

    #[error("Invalid cadence: {0}")]
    InvalidCadence(String),

    #[error("Invalid retry policy: {0}")]
    InvalidRetryPolicy(String),

    #[error(transparent)]
    Master(#[from] MasterError),
}

impl SchedulerError {
    /// Get HTTP status code
    pub fn status_code(&self) -> u16 {
        match self {
            SchedulerError::Stopped => 503,
            SchedulerError::NoBackends => 503,
            SchedulerError::DuplicateBackend(_) => 400,
            SchedulerError::InvalidCadence(_) => 400,
            SchedulerError::InvalidRetryPolicy(_) => 400,
            SchedulerError::Master(e) => e.status_code(),
        }
    }
}
