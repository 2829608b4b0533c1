//! Error handling for the connection lifecycle.
//!
//! `TransferError` is the single error type returned by the client builder,
//! the connection handle and the transport seam. Variants fall into three
//! groups that callers usually treat differently:
//!
//! **Configuration** (fatal at startup, nothing has been connected yet):
//! - `Configuration`: identity material missing or unreadable
//! - `ConfigError`: field validation failures in settings
//!
//! **Transport** (logged, usually non-fatal for a publishing loop):
//! - `NotReady`: publish attempted outside the `Ready` state
//! - `AlreadyStarted` / `Stopped`: lifecycle misuse
//! - `ClientTransfer`, `ClientConnection`, `Transport`: link failures
//! - `Serialization`: payload could not be encoded
//!
//! **Shutdown**:
//! - `ShutdownTimeout`: `stop` did not observe the terminal state in time

use std::time::Duration;

use thiserror::Error;

use super::state::ConnectionState;

#[derive(Debug, Error)]
pub enum TransferError {
    /// Identity material or a required setting is missing or unreadable.
    ///
    /// Raised by the client builder before any client object is created.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Settings failed `validator` checks.
    #[error("Configuration validation error: {0}")]
    ConfigError(#[from] validator::ValidationErrors),

    /// A publish was attempted while the connection was not `Ready`.
    ///
    /// No transport call is made when this is returned.
    #[error("Connection is not ready (current state: {0})")]
    NotReady(ConnectionState),

    /// `start` was called on a handle that already drives a connection.
    #[error("Connection already started")]
    AlreadyStarted,

    /// The handle reached `Stopped`; no further operations are valid.
    #[error("Connection is stopped")]
    Stopped,

    /// The MQTT client could not queue a request (channel closed or full).
    #[error("Client transfer error: {0}")]
    ClientTransfer(#[from] rumqttc::ClientError),

    /// Network-level connection error reported by the event loop.
    ///
    /// Boxed because `rumqttc::ConnectionError` is large.
    #[error("Client connection error: {0}")]
    ClientConnection(#[from] Box<rumqttc::ConnectionError>),

    /// Failure reported by a non-`rumqttc` transport implementation.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Payload could not be encoded for the wire.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// `stop` did not observe the `Stopped` state within the allowed time.
    #[error("Shutdown did not complete within {0:?}")]
    ShutdownTimeout(Duration),

    /// File I/O failure, typically while loading certificates.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rumqttc::ConnectionError> for TransferError {
    fn from(err: rumqttc::ConnectionError) -> Self {
        TransferError::ClientConnection(Box::new(err))
    }
}

impl TransferError {
    /// True for errors that mean the process must not proceed to connect.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            TransferError::Configuration(_) | TransferError::ConfigError(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_ready_display_names_state() {
        let err = TransferError::NotReady(ConnectionState::Connecting);
        assert_eq!(
            err.to_string(),
            "Connection is not ready (current state: Connecting)"
        );
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: TransferError = io_err.into();
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_classification() {
        assert!(TransferError::Configuration("missing key".into()).is_configuration());
        assert!(!TransferError::Stopped.is_configuration());
        assert!(!TransferError::ShutdownTimeout(Duration::from_secs(1)).is_configuration());
    }

    #[test]
    fn test_is_std_error() {
        let err: Box<dyn std::error::Error> = Box::new(TransferError::Serialization("bad".into()));
        assert_eq!(err.to_string(), "Serialization error: bad");
    }
}
