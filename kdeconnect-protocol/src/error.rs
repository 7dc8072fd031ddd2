//! Error handling for the KDE Connect protocol core.
//!
//! One `thiserror`-derived enum covers every error kind observable at the
//! crate boundary. Errors convert automatically from the underlying I/O and
//! serialization failures via `#[from]`.
//!
//! ## Error Matching
//!
//! ```rust,no_run
//! use kdeconnect_protocol::{ProtocolError, Result};
//!
//! fn handle(result: Result<()>) {
//!     match result {
//!         Ok(()) => {}
//!         Err(ProtocolError::NotConnected) => eprintln!("no channel bound"),
//!         Err(ProtocolError::PermissionDenied) => eprintln!("device not paired"),
//!         Err(e) => eprintln!("unexpected error: {}", e),
//!     }
//! }
//! ```
//!
//! ## Logging
//!
//! Use `tracing` macros proportional to how surprising the failure is:
//!
//! ```rust,ignore
//! use tracing::{debug, warn};
//!
//! if let Err(e) = channel.read_packet(&cancel).await {
//!     debug!("channel read failed: {}", e);
//! }
//! ```

use thiserror::Error;

/// Result type for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// All error kinds observable at the core's boundary (spec §7).
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A cancellation token fired before the operation completed.
    #[error("operation cancelled")]
    Cancelled,

    /// The peer closed the connection, possibly mid-packet.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// The operation requires a bound Channel but the Device has none.
    #[error("device is not connected")]
    NotConnected,

    /// The operation requires `paired == true`.
    #[error("device is not paired")]
    PermissionDenied,

    /// Attempted to open a multiplexer channel UUID that is already open.
    #[error("address already in use: {0}")]
    AddressInUse(String),

    /// A multiplexer substream received more bytes than its read credit allowed.
    #[error("message too large: {0}")]
    MessageTooLarge(String),

    /// The packet is not a JSON object, or is otherwise unparsable as one.
    #[error("malformed packet: {0}")]
    Malformed(String),

    /// A required field is absent from the packet body or envelope.
    #[error("missing field: {0}")]
    MissingField(String),

    /// A field is present but has the wrong JSON type.
    #[error("invalid field: {0}")]
    InvalidField(String),

    /// A field has the right type but an invalid value (e.g. empty type string).
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Certificate generation, parsing, or pinning failed.
    #[error("certificate error: {0}")]
    CertificateError(String),

    /// The requested device does not exist in the Manager.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// A plugin-level failure (registration conflict, handler error, …).
    #[error("plugin error: {0}")]
    Plugin(String),

    /// A Bluetooth/BlueZ-level failure.
    #[error("bluetooth error: {0}")]
    Bluetooth(String),

    /// Ambient I/O failure (socket, filesystem, …).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Ambient JSON (de)serialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Ambient OpenSSL failure (certificate generation, TLS handshake).
    #[error("TLS error: {0}")]
    Tls(#[from] openssl::error::ErrorStack),
}

impl ProtocolError {
    /// Whether retrying the same operation might succeed without user action.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProtocolError::Cancelled
                | ProtocolError::ConnectionClosed
                | ProtocolError::Io(_)
                | ProtocolError::AddressInUse(_)
        )
    }

    /// Whether the user must do something (re-pair, grant permission, …)
    /// before this operation can succeed.
    pub fn requires_user_action(&self) -> bool {
        matches!(
            self,
            ProtocolError::PermissionDenied | ProtocolError::CertificateError(_)
        )
    }

    /// A short message suitable for surfacing to a human (daemon logs, a
    /// future GUI notification) rather than a developer.
    pub fn user_message(&self) -> String {
        match self {
            ProtocolError::NotConnected => "Device is not connected".to_string(),
            ProtocolError::PermissionDenied => "Device is not paired".to_string(),
            ProtocolError::DeviceNotFound(id) => format!("Unknown device: {id}"),
            ProtocolError::CertificateError(_) => "Failed to set up device identity".to_string(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_errors() {
        assert!(ProtocolError::Cancelled.is_recoverable());
        assert!(ProtocolError::ConnectionClosed.is_recoverable());
        assert!(!ProtocolError::PermissionDenied.is_recoverable());
    }

    #[test]
    fn user_action_errors() {
        assert!(ProtocolError::PermissionDenied.requires_user_action());
        assert!(!ProtocolError::NotConnected.requires_user_action());
    }

    #[test]
    fn display_messages() {
        assert_eq!(
            ProtocolError::NotConnected.to_string(),
            "device is not connected"
        );
        assert_eq!(
            ProtocolError::MissingField("deviceId".into()).to_string(),
            "missing field: deviceId"
        );
    }

    #[test]
    fn json_error_converts() {
        let bad: std::result::Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err: ProtocolError = bad.unwrap_err().into();
        assert!(matches!(err, ProtocolError::Json(_)));
    }
}
