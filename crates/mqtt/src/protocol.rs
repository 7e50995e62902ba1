//! Capability interface between the session and an MQTT protocol client.
//!
//! The session never touches sockets. It issues requests through
//! [`ProtocolClient`] and receives asynchronous outcomes through
//! [`ProtocolHandler`]. Every request method only reports whether the client
//! *accepted* the request; the broker's answer arrives later as a callback.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::error::SessionError;

/// Username and password for broker authentication.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: Option<String>) -> Self {
        Self {
            username: username.into(),
            password,
        }
    }
}

// Keep passwords out of logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Everything the protocol client needs to open a session.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectRequest {
    pub host: String,
    pub port: u16,
    pub keep_alive: Duration,
    pub credentials: Option<Credentials>,
    pub client_id: String,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The session was closed on request (clean disconnect).
    Requested,
    /// The session dropped on its own.
    Unexpected(String),
}

/// A raw inbound publish, before decoding and timestamping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
    pub pkid: Option<u16>,
}

/// Callbacks from the protocol client. Invoked on the client's own task.
pub trait ProtocolHandler: Send + Sync {
    /// CONNACK received. `0` means accepted, anything else is a refusal code.
    fn on_connect(&self, code: u8);

    fn on_disconnect(&self, reason: DisconnectReason);

    fn on_message(&self, delivery: Delivery);

    /// The transport could not be established at all.
    fn on_connect_failure(&self, reason: String);

    /// The broker answered a subscribe for `topic` with the SUBACK failure code.
    fn on_subscribe_rejected(&self, topic: String);
}

/// Requests the session can make of a protocol client.
///
/// Implementations must not block and must not call back into the handler
/// synchronously from within these methods.
pub trait ProtocolClient: Send + Sync {
    fn connect(
        &self,
        request: &ConnectRequest,
        handler: Arc<dyn ProtocolHandler>,
    ) -> Result<(), SessionError>;

    fn disconnect(&self) -> Result<(), SessionError>;

    fn subscribe(&self, topic: &str, qos: u8) -> Result<(), SessionError>;

    /// Subscribes to several topics at once. An `Err` means the batch as a
    /// whole was not accepted.
    fn subscribe_many(&self, topics: &[(String, u8)]) -> Result<(), SessionError> {
        topics
            .iter()
            .try_for_each(|(topic, qos)| self.subscribe(topic, *qos))
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), SessionError>;
}

/// SUBACK return code for a refused subscription.
pub const SUBACK_FAILURE: u8 = 0x80;

/// Reason text for an MQTT 3.1.1 CONNACK return code.
pub fn connack_reason(code: u8) -> &'static str {
    match code {
        0 => "Connection accepted",
        1 => "Unacceptable protocol version",
        2 => "Identifier rejected",
        3 => "Server unavailable",
        4 => "Bad username or password",
        5 => "Not authorized",
        _ => "Unknown return code",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_debug_hides_password() {
        let creds = Credentials::new("alice", Some("hunter2".into()));
        let rendered = format!("{:?}", creds);
        assert!(rendered.contains("alice"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_connack_reason() {
        assert_eq!(connack_reason(0), "Connection accepted");
        assert_eq!(connack_reason(5), "Not authorized");
        assert_eq!(connack_reason(42), "Unknown return code");
    }
}
