//! Connection status of a broker session.
//!
//! The status is owned by the session state machine and changes only while the
//! connection lock is held, so every observer sees the same totally ordered
//! sequence of transitions.
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──CONNACK ok──▶ Connected
//!      ▲                        │                         │
//!      │                 refused/failed              unexpected drop
//!      │                        ▼                         ▼
//!      └──disconnect──── ConnectionFailed        ConnectionLost
//!                               └──── backoff timer ──────┘──▶ Connecting
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Current state of the broker session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// No session and none wanted. Initial state, and the state after an
    /// explicit `disconnect`.
    #[default]
    Disconnected,

    /// A connect request was handed to the protocol client; waiting for CONNACK.
    Connecting,

    /// The broker accepted the session. Subscriptions are live.
    Connected,

    /// The broker refused the session or the transport could not be set up.
    /// A reconnect is scheduled if auto-reconnect is enabled.
    ConnectionFailed,

    /// An established session dropped without being asked to.
    /// A reconnect is scheduled if auto-reconnect is enabled.
    ConnectionLost,
}

impl ConnectionStatus {
    /// Human-readable label, stable for display.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "Disconnected",
            ConnectionStatus::Connecting => "Connecting",
            ConnectionStatus::Connected => "Connected",
            ConnectionStatus::ConnectionFailed => "Connection Failed",
            ConnectionStatus::ConnectionLost => "Connection Lost",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }

    /// Whether a new `connect` request is accepted from this state.
    pub fn accepts_connect(&self) -> bool {
        !matches!(
            self,
            ConnectionStatus::Connecting | ConnectionStatus::Connected
        )
    }

    /// Whether the protocol client may still hold an open (or opening) session.
    pub fn has_open_session(&self) -> bool {
        matches!(
            self,
            ConnectionStatus::Connecting | ConnectionStatus::Connected
        )
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_as_str() {
        assert_eq!(ConnectionStatus::Disconnected.as_str(), "Disconnected");
        assert_eq!(ConnectionStatus::Connecting.as_str(), "Connecting");
        assert_eq!(ConnectionStatus::Connected.as_str(), "Connected");
        assert_eq!(
            ConnectionStatus::ConnectionFailed.as_str(),
            "Connection Failed"
        );
        assert_eq!(ConnectionStatus::ConnectionLost.as_str(), "Connection Lost");
    }

    #[test]
    fn test_default_is_disconnected() {
        assert_eq!(ConnectionStatus::default(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn test_accepts_connect() {
        assert!(ConnectionStatus::Disconnected.accepts_connect());
        assert!(ConnectionStatus::ConnectionFailed.accepts_connect());
        assert!(ConnectionStatus::ConnectionLost.accepts_connect());
        assert!(!ConnectionStatus::Connecting.accepts_connect());
        assert!(!ConnectionStatus::Connected.accepts_connect());
    }

    #[test]
    fn test_display_matches_label() {
        assert_eq!(
            ConnectionStatus::ConnectionLost.to_string(),
            "Connection Lost"
        );
    }
}
