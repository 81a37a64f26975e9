//! # Protocol Errors
//!
//! Refusals are not errors: a declined attempt travels as a
//! [`Refusal`](super::Refusal). Everything here is a fault.

use thiserror::Error;

use super::listener::RefusalReason;

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Transport, framing and configuration faults.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("private key error: {0}")]
    PrivateKey(String),

    #[error("identity issuance failed: {0}")]
    Issuance(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("TLS handshake error: {0}")]
    Handshake(String),

    #[error("frame payload too large: {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("unexpected frame: expected {expected}, got {got}")]
    UnexpectedFrame {
        expected: &'static str,
        got: &'static str,
    },

    #[error("protocol version mismatch: ours {ours}, theirs {theirs}")]
    VersionMismatch { ours: u32, theirs: u32 },

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("remote failure: {0}")]
    Remote(String),

    #[error("connection closed")]
    ConnectionClosed,
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => ProtocolError::ConnectionClosed,
            _ => ProtocolError::Io(err.to_string()),
        }
    }
}

/// The peer's identity could not be trusted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SecurityError {
    #[error("peer presented no certificate")]
    MissingCertificate,

    #[error("peer certificate is not valid: {0}")]
    InvalidCertificate(String),

    #[error("organization {declared} does not match certificate organization {certified}")]
    OrganizationMismatch { declared: String, certified: String },

    #[error("identity {presented} for {organization} does not match pinned identity {expected}")]
    IdentityMismatch {
        organization: String,
        expected: String,
        presented: String,
    },
}

/// Why a listener stopped an attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    /// Policy decision; reported as a refusal.
    #[error("refused: {0}")]
    Refused(RefusalReason),

    /// Identity could not be validated; always fatal to the attempt.
    #[error("security failure: {0}")]
    Security(#[from] SecurityError),

    /// Endpoint unreachable or local I/O problem.
    #[error("I/O failure: {0}")]
    Io(String),
}

/// How a failed attempt ended.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionFailure {
    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl ConnectionFailure {
    pub fn is_security(&self) -> bool {
        matches!(self, ConnectionFailure::Security(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eof_maps_to_closed() {
        let err: ProtocolError =
            std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof").into();
        assert_eq!(err, ProtocolError::ConnectionClosed);
    }

    #[test]
    fn test_failure_classification() {
        let failure = ConnectionFailure::from(SecurityError::MissingCertificate);
        assert!(failure.is_security());
        let failure = ConnectionFailure::from(ProtocolError::ConnectionClosed);
        assert!(!failure.is_security());
    }
}
