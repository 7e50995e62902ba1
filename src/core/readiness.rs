//! Readiness state derived from the broker session.
//!
//! Components that only make sense while traffic flows (the statistics
//! reporter) subscribe here and wait for `Ready` instead of polling the
//! session.

use std::fmt;

use mqviz_mqtt::ConnectionStatus;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Represents the current readiness state of the system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessState {
    /// Connected to the broker.
    Ready,
    /// Not connected, with a human-readable reason.
    NotReadyYet(String),
    /// No status has been observed yet.
    Unknown,
}

impl ReadinessState {
    pub fn is_ready(&self) -> bool {
        matches!(self, ReadinessState::Ready)
    }

    pub fn as_str(&self) -> &str {
        match self {
            ReadinessState::Ready => "Ready",
            ReadinessState::NotReadyYet(_) => "NotReadyYet",
            ReadinessState::Unknown => "Unknown",
        }
    }

    /// The reason if the state is `NotReadyYet`, otherwise an empty string.
    pub fn reason(&self) -> &str {
        match self {
            ReadinessState::NotReadyYet(reason) => reason,
            _ => "",
        }
    }
}

impl fmt::Display for ReadinessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadinessState::Ready => write!(f, "Ready"),
            ReadinessState::NotReadyYet(reason) => write!(f, "NotReadyYet: {}", reason),
            ReadinessState::Unknown => write!(f, "Unknown"),
        }
    }
}

impl From<ConnectionStatus> for ReadinessState {
    fn from(status: ConnectionStatus) -> Self {
        match status {
            ConnectionStatus::Connected => ReadinessState::Ready,
            ConnectionStatus::Connecting => {
                ReadinessState::NotReadyYet("Connecting...".to_string())
            }
            ConnectionStatus::Disconnected => {
                ReadinessState::NotReadyYet("Disconnected".to_string())
            }
            ConnectionStatus::ConnectionFailed => {
                ReadinessState::NotReadyYet("Connection failed, retrying".to_string())
            }
            ConnectionStatus::ConnectionLost => {
                ReadinessState::NotReadyYet("Connection lost, reconnecting".to_string())
            }
        }
    }
}

/// Forwards session status changes into readiness until either side closes.
pub async fn listen(
    mut status_rx: watch::Receiver<ConnectionStatus>,
    state_tx: watch::Sender<ReadinessState>,
) {
    debug!("Launching session status listener");

    let initial = *status_rx.borrow_and_update();
    let _ = state_tx.send(ReadinessState::from(initial));
    debug!("Initial session status: {}", initial);

    while status_rx.changed().await.is_ok() {
        let status = *status_rx.borrow_and_update();
        let readiness = ReadinessState::from(status);
        debug!("Transition: session {} -> readiness {}", status, readiness);

        if state_tx.send(readiness).is_err() {
            warn!("No subscribers to readiness status");
            break;
        }
    }

    debug!("Session status channel closed, listening stopped");
}

/// Shared readiness tracker that allows multiple components to observe state changes.
#[derive(Debug, Clone)]
pub struct Readiness {
    state_tx: watch::Sender<ReadinessState>,
    state_rx: watch::Receiver<ReadinessState>,
}

impl Readiness {
    /// Creates a new readiness tracker with an initial `Unknown` state.
    pub fn new() -> Self {
        let (state_tx, state_rx) = watch::channel(ReadinessState::Unknown);
        Self { state_tx, state_rx }
    }

    pub fn subscribe(&self) -> watch::Receiver<ReadinessState> {
        self.state_rx.clone()
    }

    pub fn current_state(&self) -> ReadinessState {
        self.state_rx.borrow().clone()
    }

    /// Spawns a task that follows the session status channel.
    pub fn start_listening(&self, status_rx: watch::Receiver<ConnectionStatus>) {
        let state_tx = self.state_tx.clone();
        tokio::spawn(listen(status_rx, state_tx));
    }

    /// Manually updates the readiness state.
    pub fn set_state(&self, state: ReadinessState) {
        let old_state = self.state_rx.borrow().clone();
        let _ = self.state_tx.send(state.clone());
        debug!(
            "The readiness status has changed: {} -> {}",
            old_state, state
        );
    }
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readiness_state_helpers() {
        assert!(ReadinessState::Ready.is_ready());
        assert!(!ReadinessState::Unknown.is_ready());
        assert_eq!(
            ReadinessState::NotReadyYet("reason".into()).as_str(),
            "NotReadyYet"
        );
        assert_eq!(ReadinessState::Ready.reason(), "");
        assert_eq!(
            ReadinessState::NotReadyYet("test reason".into()).reason(),
            "test reason"
        );
        assert_eq!(
            ReadinessState::NotReadyYet("x".into()).to_string(),
            "NotReadyYet: x"
        );
    }

    #[test]
    fn test_only_connected_is_ready() {
        assert!(ReadinessState::from(ConnectionStatus::Connected).is_ready());
        for status in [
            ConnectionStatus::Disconnected,
            ConnectionStatus::Connecting,
            ConnectionStatus::ConnectionFailed,
            ConnectionStatus::ConnectionLost,
        ] {
            assert!(!ReadinessState::from(status).is_ready(), "{status}");
        }
    }

    #[tokio::test]
    async fn test_set_state_notifies_subscribers() {
        let readiness = Readiness::new();
        assert_eq!(readiness.current_state(), ReadinessState::Unknown);

        let mut rx1 = readiness.subscribe();
        let mut rx2 = readiness.subscribe();
        readiness.set_state(ReadinessState::Ready);

        rx1.changed().await.unwrap();
        rx2.changed().await.unwrap();
        assert_eq!(*rx1.borrow(), ReadinessState::Ready);
        assert_eq!(*rx2.borrow(), ReadinessState::Ready);
    }

    #[tokio::test]
    async fn test_follows_session_status() {
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connecting);
        let readiness = Readiness::new();
        let mut rx = readiness.subscribe();
        readiness.start_listening(status_rx);

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().reason(), "Connecting...");

        status_tx.send(ConnectionStatus::Connected).unwrap();
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().is_ready());

        status_tx.send(ConnectionStatus::ConnectionLost).unwrap();
        rx.changed().await.unwrap();
        assert!(!rx.borrow().is_ready());
    }
}
