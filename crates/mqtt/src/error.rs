use std::time::Duration;

use thiserror::Error;

use super::state::ConnectionStatus;

/// The unified error type for session operations.
///
/// Every public operation on [`Session`](crate::Session) reports failure through
/// this type instead of panicking. Operations that talk to the broker also keep
/// the rendered message as the session's "last error", so a presentation layer
/// can show it without holding on to the `Err` value.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The requested transition is not valid from the current status.
    ///
    /// Returned by `connect` while a connection is already being established
    /// or is established.
    #[error("Connect rejected: session is {0}")]
    ConnectRejected(ConnectionStatus),

    /// The protocol client refused or failed the request locally.
    ///
    /// Covers failures to hand a connect/disconnect/subscribe request to the
    /// network layer (request channel closed or full, client not started).
    #[error("Network failure: {0}")]
    NetworkFailure(String),

    /// The broker answered with a non-success code.
    #[error("Protocol failure (code {code}): {reason}")]
    ProtocolFailure { code: u8, reason: String },

    /// The incoming queue stayed full even after evicting its oldest item.
    #[error("Incoming queue overflow at {0} messages, message dropped")]
    QueueOverflow(usize),

    /// The background worker did not stop within the requested bound.
    #[error("Message worker did not shut down within {0:?}")]
    WorkerShutdownTimeout(Duration),

    /// The operation requires an established broker session.
    #[error("Not connected to broker")]
    NotConnected,

    /// Topic filter failed validation.
    #[error("Invalid topic filter '{topic}': {reason}")]
    InvalidTopic { topic: String, reason: String },

    /// QoS outside 0..=2.
    #[error("Invalid QoS value {0}, must be 0, 1, or 2")]
    InvalidQos(u8),

    /// No tokio runtime available to spawn background tasks on.
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// MQTT client initialization failed (bad TLS material, unreadable files).
    #[error("Client setup error: {0}")]
    ClientSetup(String),

    /// Configuration validation failed.
    #[error("Configuration error: {0}")]
    Config(#[from] validator::ValidationErrors),

    /// Reading certificate material from disk failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rumqttc::ClientError> for SessionError {
    fn from(err: rumqttc::ClientError) -> Self {
        SessionError::NetworkFailure(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_rejected_display() {
        let err = SessionError::ConnectRejected(ConnectionStatus::Connected);
        assert_eq!(err.to_string(), "Connect rejected: session is Connected");
    }

    #[test]
    fn test_protocol_failure_display() {
        let err = SessionError::ProtocolFailure {
            code: 5,
            reason: "Not authorized".into(),
        };
        assert_eq!(err.to_string(), "Protocol failure (code 5): Not authorized");
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: SessionError = io_err.into();
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_worker_timeout_display() {
        let err = SessionError::WorkerShutdownTimeout(Duration::from_millis(250));
        assert!(err.to_string().contains("250ms"));
    }
}
