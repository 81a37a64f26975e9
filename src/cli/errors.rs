//! CLI-specific error types
//!
//! All CLI errors are fatal: the binary prints them and exits non-zero.

use std::io;

use thiserror::Error;

use crate::config::ConfigError;
use crate::coordinator::CoordinatorError;
use crate::protocol::ProtocolError;

/// CLI error
#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("TLS error: {0}")]
    Tls(#[from] ProtocolError),

    #[error("Startup failed: {0}")]
    Startup(String),

    #[error("Demo failed: {0}")]
    Demo(String),
}

impl CliError {
    /// Stable error code string
    pub fn code(&self) -> &'static str {
        match self {
            CliError::Config(_) => "METAFLEET_CLI_CONFIG_ERROR",
            CliError::Io(_) => "METAFLEET_CLI_IO_ERROR",
            CliError::Tls(_) => "METAFLEET_CLI_TLS_ERROR",
            CliError::Startup(_) => "METAFLEET_CLI_STARTUP_FAILED",
            CliError::Demo(_) => "METAFLEET_CLI_DEMO_FAILED",
        }
    }
}

impl From<io::Error> for CliError {
    fn from(e: io::Error) -> Self {
        CliError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        CliError::Io(format!("JSON error: {}", e))
    }
}

impl From<CoordinatorError> for CliError {
    fn from(e: CoordinatorError) -> Self {
        CliError::Startup(e.to_string())
    }
}

/// CLI result type
pub type CliResult<T> = Result<T, CliError>;
