//! Observer registration and the outbound event stream.
//!
//! Consumers can follow a session three ways:
//!
//! * callbacks registered with `on_status_change`, `on_message`,
//!   `on_connected`, `on_error` and `on_queue_full`
//! * a `watch` channel carrying the current [`ConnectionStatus`]
//! * a `broadcast` stream of [`SessionEvent`]s
//!
//! Callbacks run on the session's own tasks, never while a session lock is
//! held. A panicking callback is logged and skipped; the remaining callbacks
//! still run and the calling task survives.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::error;

use super::{message::Message, state::ConnectionStatus};

/// Item of the broadcast event stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SessionEvent {
    StatusChanged(ConnectionStatus),
    MessageArrived(Message),
    Error(String),
}

type Observer<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Ordered list of callbacks for one kind of notification.
pub struct ObserverList<T> {
    kind: &'static str,
    observers: RwLock<Vec<Observer<T>>>,
}

impl<T> ObserverList<T> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn register<F>(&self, observer: F)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(observer));
    }

    pub fn len(&self) -> usize {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls every observer in registration order.
    pub fn notify(&self, value: &T) {
        // Snapshot so an observer may register further observers.
        let observers = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for observer in observers {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| observer(value))) {
                error!(
                    kind = self.kind,
                    "Observer panicked: {}",
                    panic_message(panic.as_ref())
                );
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Every notification target of one session.
///
/// Shared between the session's dispatcher and the ingestion worker.
pub struct EventHub {
    status: ObserverList<ConnectionStatus>,
    message: ObserverList<Message>,
    connected: ObserverList<()>,
    error: ObserverList<String>,
    queue_full: ObserverList<usize>,
    events: broadcast::Sender<SessionEvent>,
    status_tx: watch::Sender<ConnectionStatus>,
}

impl EventHub {
    pub fn new(event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        let (status_tx, _) = watch::channel(ConnectionStatus::default());

        Self {
            status: ObserverList::new("status"),
            message: ObserverList::new("message"),
            connected: ObserverList::new("connected"),
            error: ObserverList::new("error"),
            queue_full: ObserverList::new("queue_full"),
            events,
            status_tx,
        }
    }

    pub fn on_status_change<F>(&self, f: F)
    where
        F: Fn(&ConnectionStatus) + Send + Sync + 'static,
    {
        self.status.register(f);
    }

    pub fn on_message<F>(&self, f: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.message.register(f);
    }

    pub fn on_connected<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.connected.register(move |_: &()| f());
    }

    pub fn on_error<F>(&self, f: F)
    where
        F: Fn(&String) + Send + Sync + 'static,
    {
        self.error.register(f);
    }

    pub fn on_queue_full<F>(&self, f: F)
    where
        F: Fn(&usize) + Send + Sync + 'static,
    {
        self.queue_full.register(f);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    pub fn publish_status(&self, status: ConnectionStatus) {
        self.status_tx.send_replace(status);
        self.status.notify(&status);
        // No receivers is fine
        let _ = self.events.send(SessionEvent::StatusChanged(status));
    }

    pub fn publish_connected(&self) {
        self.connected.notify(&());
    }

    pub fn publish_error(&self, message: &str) {
        let message = message.to_string();
        self.error.notify(&message);
        let _ = self.events.send(SessionEvent::Error(message));
    }

    pub fn publish_message(&self, message: &Message) {
        self.message.notify(message);
        let _ = self.events.send(SessionEvent::MessageArrived(message.clone()));
    }

    pub fn publish_queue_full(&self, size: usize) {
        self.queue_full.notify(&size);
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tracing_test::traced_test;

    fn message(topic: &str) -> Message {
        Message {
            topic: topic.into(),
            payload: "1".into(),
            timestamp: 1.0,
            qos: 0,
            retain: false,
            id: None,
        }
    }

    #[test]
    fn test_observers_called_in_order() {
        let list = ObserverList::new("test");
        let seen = Arc::new(Mutex::new(Vec::new()));

        for id in 0..3 {
            let seen = seen.clone();
            list.register(move |value: &u32| seen.lock().unwrap().push((id, *value)));
        }
        list.notify(&7);

        assert_eq!(*seen.lock().unwrap(), vec![(0, 7), (1, 7), (2, 7)]);
    }

    #[test]
    #[traced_test]
    fn test_panicking_observer_is_isolated() {
        let list = ObserverList::new("message");
        let calls = Arc::new(AtomicUsize::new(0));

        list.register(|_: &u32| panic!("boom"));
        let counter = calls.clone();
        list.register(move |_: &u32| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        list.notify(&1);
        list.notify(&2);

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(logs_contain("Observer panicked: boom"));
    }

    #[test]
    fn test_status_reaches_watch_and_stream() {
        let hub = EventHub::new(16);
        let status_rx = hub.subscribe_status();
        let mut events = hub.subscribe_events();

        hub.publish_status(ConnectionStatus::Connecting);

        assert_eq!(*status_rx.borrow(), ConnectionStatus::Connecting);
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::StatusChanged(ConnectionStatus::Connecting)
        );
    }

    #[test]
    fn test_message_and_error_events() {
        let hub = EventHub::new(16);
        let mut events = hub.subscribe_events();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        hub.on_error(move |e| sink.lock().unwrap().push(e.clone()));

        hub.publish_message(&message("a"));
        hub.publish_error("broken");

        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::MessageArrived(message("a"))
        );
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::Error("broken".into())
        );
        assert_eq!(*errors.lock().unwrap(), vec!["broken".to_string()]);
    }

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let hub = EventHub::default();
        hub.publish_status(ConnectionStatus::Connected);
        hub.publish_message(&message("a"));
        hub.publish_queue_full(10);
        assert_eq!(*hub.subscribe_status().borrow(), ConnectionStatus::Connected);
    }

    #[test]
    fn test_event_serialization() {
        let json = serde_json::to_string(&SessionEvent::StatusChanged(
            ConnectionStatus::ConnectionLost,
        ))
        .unwrap();
        assert_eq!(json, r#"{"type":"status_changed","data":"ConnectionLost"}"#);
    }
}
