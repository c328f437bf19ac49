//! Error handling for the device session engine
//!
//! All protocol operations return [`Result`], and every failure mode is a
//! variant of [`ProtocolError`]. Underlying library errors convert
//! automatically via `thiserror` `#[from]` implementations. No error in this
//! crate terminates the engine; callers degrade to disconnected or inactive
//! states and surface the failure through lifecycle events.

use thiserror::Error;

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors that can occur during protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// I/O error (socket, file system)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TLS handshake or record-layer error
    #[error("TLS error: {0}")]
    Tls(#[from] openssl::ssl::Error),

    /// Certificate parsing or key loading error
    #[error("Certificate error: {0}")]
    Certificate(#[from] openssl::error::ErrorStack),

    /// Certificate fingerprint did not match the trust record
    #[error("Certificate validation error: {0}")]
    CertificateValidation(String),

    /// Malformed or unexpected packet
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// Frame exceeded the in-band size bound
    #[error("Packet size exceeded: {0} bytes (max: {1})")]
    PacketSizeExceeded(usize, usize),

    /// A bounded operation (identity read, TLS handshake) expired
    #[error("Timeout: {0}")]
    Timeout(String),

    /// No active link exists for the device
    #[error("Not connected to device {0}")]
    NotConnected(String),

    /// Operation requires a paired device
    #[error("Not paired")]
    NotPaired,

    /// Device is not known to the session registry
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Pairing state machine rejected the transition
    #[error("Pairing error: {0}")]
    Pairing(String),

    /// Plugin registration or dispatch error
    #[error("Plugin error: {0}")]
    Plugin(String),

    /// Plugin lacks the required permission
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Socket-level failure on an established link
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Operation was cancelled by shutdown
    #[error("Operation cancelled: {0}")]
    Cancelled(String),
}

impl ProtocolError {
    /// Convert a generic I/O error into a more specific variant
    pub fn from_io_error(error: std::io::Error, context: &str) -> Self {
        use std::io::ErrorKind;

        match error.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(format!("{}: {}", context, error)),
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                ProtocolError::NetworkError(format!("{}: connection interrupted ({})", context, error))
            }
            ErrorKind::ConnectionRefused => {
                ProtocolError::NetworkError(format!("{}: {}", context, error))
            }
            _ => ProtocolError::Io(error),
        }
    }

    /// Whether a retry might succeed (drives reconnect scheduling)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProtocolError::Timeout(_)
                | ProtocolError::NetworkError(_)
                | ProtocolError::NotConnected(_)
                | ProtocolError::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ProtocolError::DeviceNotFound("phone_a".to_string());
        assert_eq!(error.to_string(), "Device not found: phone_a");

        let error = ProtocolError::NotPaired;
        assert_eq!(error.to_string(), "Not paired");

        let error = ProtocolError::PacketSizeExceeded(2_000_000, 1_048_576);
        assert_eq!(
            error.to_string(),
            "Packet size exceeded: 2000000 bytes (max: 1048576)"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        use std::io::{Error, ErrorKind};

        let io_error = Error::new(ErrorKind::NotFound, "file not found");
        let protocol_error: ProtocolError = io_error.into();
        assert!(matches!(protocol_error, ProtocolError::Io(_)));
    }

    #[test]
    fn test_from_io_error_classification() {
        use std::io::{Error, ErrorKind};

        let error = ProtocolError::from_io_error(
            Error::new(ErrorKind::TimedOut, "timed out"),
            "identity read",
        );
        assert!(matches!(error, ProtocolError::Timeout(_)));

        let error = ProtocolError::from_io_error(
            Error::new(ErrorKind::ConnectionReset, "reset"),
            "link read",
        );
        assert!(matches!(error, ProtocolError::NetworkError(_)));
    }

    #[test]
    fn test_recoverability() {
        assert!(ProtocolError::Timeout("handshake".to_string()).is_recoverable());
        assert!(ProtocolError::NotConnected("phone_a".to_string()).is_recoverable());
        assert!(!ProtocolError::NotPaired.is_recoverable());
        assert!(!ProtocolError::InvalidPacket("bad frame".to_string()).is_recoverable());
    }
}
