//! Broker session state machine with automatic reconnection.
//!
//! [`Session`] owns the connection status, the broker target, the subscription
//! registry and the reconnect timer, all behind one connection lock. Protocol
//! callbacks, caller requests and the reconnect timer all mutate that state
//! through the same lock, so status transitions form a single ordered
//! sequence.
//!
//! Observers never run under the lock. Each transition pushes a notification
//! onto an unbounded channel while the lock is held (preserving order) and a
//! dispatcher task delivers it afterwards.
//!
//! ```ignore
//! let protocol = Arc::new(MqttProtocol::new(config.clone())?);
//! let session = Session::new(protocol, config)?;
//!
//! session.on_status_change(|status| println!("status: {status}"));
//! session.subscribe_to_topic("sensors/#", 0)?;   // queued until connected
//! session.connect("broker.local", 1883, None)?;
//! // ...
//! session.disconnect().await?;
//! ```

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use validator::Validate;

use super::{
    backoff::Backoff,
    config::Config,
    error::SessionError,
    events::{EventHub, SessionEvent},
    message::Message,
    pipeline::IngestionPipeline,
    protocol::{
        connack_reason, ConnectRequest, Credentials, Delivery, DisconnectReason, ProtocolClient,
        ProtocolHandler, SUBACK_FAILURE,
    },
    registry::SubscriptionRegistry,
    state::ConnectionStatus,
    stats::StatisticsSnapshot,
    topic::qos_from_u8,
};

/// Pause after closing a session so the protocol client can flush the
/// DISCONNECT packet and in-flight notifications can land.
const DISCONNECT_SETTLE: Duration = Duration::from_millis(100);

/// Snapshot of the session for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionInfo {
    pub status: ConnectionStatus,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub client_id: String,
    pub connection_attempts: u32,
    pub reconnect_attempts: u32,
    pub auto_reconnect: bool,
    pub last_error: Option<String>,
    pub subscribed_topics: BTreeMap<String, u8>,
    pub pending_topics: Vec<String>,
    pub total_messages: u64,
    pub messages_per_second: f64,
    pub active_topics: usize,
}

#[derive(Debug, Clone)]
struct BrokerTarget {
    host: String,
    port: u16,
    credentials: Option<Credentials>,
}

struct ReconnectTimer {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Everything guarded by the connection lock.
struct ConnectionState {
    status: ConnectionStatus,
    target: Option<BrokerTarget>,
    last_error: Option<String>,
    connection_attempts: u32,
    backoff: Backoff,
    auto_reconnect: bool,
    registry: SubscriptionRegistry,
    reconnect_timer: Option<ReconnectTimer>,
}

enum Notification {
    Status(ConnectionStatus),
    Connected,
    Error(String),
}

struct SessionInner {
    self_ref: Weak<SessionInner>,
    protocol: Arc<dyn ProtocolClient>,
    config: Config,
    client_id: String,
    runtime: Handle,
    state: Mutex<ConnectionState>,
    pipeline: IngestionPipeline,
    events: Arc<EventHub>,
    notify_tx: mpsc::UnboundedSender<Notification>,
}

/// A resilient broker session. Cheap to clone; clones share one session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Builds a session over the given protocol client.
    ///
    /// Must be called from within a tokio runtime: the session spawns its
    /// notification dispatcher, ingestion worker and reconnect timers there.
    pub fn new(protocol: Arc<dyn ProtocolClient>, config: Config) -> Result<Self, SessionError> {
        config.validate()?;

        let runtime = Handle::try_current()
            .map_err(|e| SessionError::Runtime(format!("no tokio runtime: {e}")))?;

        let events = Arc::new(EventHub::new(config.event_channel_capacity));
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        runtime.spawn(dispatch_notifications(notify_rx, events.clone()));

        let backoff = Backoff::new(
            Duration::from_secs(config.reconnect.base_delay),
            Duration::from_secs(config.reconnect.max_delay),
            2.0,
        )
        .with_max_attempts(config.reconnect.max_attempts);

        let state = ConnectionState {
            status: ConnectionStatus::Disconnected,
            target: None,
            last_error: None,
            connection_attempts: 0,
            backoff,
            auto_reconnect: config.reconnect.auto,
            registry: SubscriptionRegistry::new(),
            reconnect_timer: None,
        };

        let pipeline = IngestionPipeline::new(&config.queue, events.clone(), runtime.clone());
        let client_id = config.resolve_client_id();

        let inner = Arc::new_cyclic(|self_ref| SessionInner {
            self_ref: self_ref.clone(),
            protocol,
            config,
            client_id,
            runtime,
            state: Mutex::new(state),
            pipeline,
            events,
            notify_tx,
        });

        Ok(Self { inner })
    }

    /// Starts connecting to a broker.
    ///
    /// Only accepted from `Disconnected`, `ConnectionFailed` or
    /// `ConnectionLost`. Success means the request was handed to the protocol
    /// client; the outcome arrives later as a status change.
    pub fn connect(
        &self,
        host: &str,
        port: u16,
        credentials: Option<Credentials>,
    ) -> Result<(), SessionError> {
        let inner = &self.inner;
        let mut state = inner.lock_state();

        if !state.status.accepts_connect() {
            warn!(status = %state.status, "Connect rejected");
            return Err(SessionError::ConnectRejected(state.status));
        }

        let target = BrokerTarget {
            host: host.to_string(),
            port,
            credentials,
        };
        inner.connect_locked(&mut state, target)
    }

    /// Closes the session and stops automatic reconnection.
    ///
    /// Valid from any state and idempotent.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.inner.disconnect().await
    }

    /// Subscribes to a topic filter, or queues it until the next connect.
    pub fn subscribe_to_topic(&self, topic: &str, qos: u8) -> Result<(), SessionError> {
        self.inner.subscribe(topic, qos)
    }

    /// Subscribes to several filters, reporting each outcome separately.
    pub fn subscribe_to_topics(
        &self,
        topics: &[(&str, u8)],
    ) -> Vec<(String, Result<(), SessionError>)> {
        topics
            .iter()
            .map(|(topic, qos)| (topic.to_string(), self.inner.subscribe(topic, *qos)))
            .collect()
    }

    /// Unsubscribes from an active topic. Requires an established session.
    pub fn unsubscribe_from_topic(&self, topic: &str) -> Result<(), SessionError> {
        self.inner.unsubscribe(topic)
    }

    /// Unsubscribes from every active topic. Returns the first failure after
    /// trying all of them.
    pub fn unsubscribe_from_all(&self) -> Result<(), SessionError> {
        let topics = self.inner.lock_state().registry.active_topics();

        let mut first_error = None;
        for topic in topics {
            if let Err(e) = self.inner.unsubscribe(&topic) {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn get_subscribed_topics(&self) -> BTreeMap<String, u8> {
        self.inner.lock_state().registry.active()
    }

    pub fn get_pending_topics(&self) -> Vec<String> {
        self.inner.lock_state().registry.pending_topics()
    }

    pub fn is_subscribed_to(&self, topic: &str) -> bool {
        self.inner.lock_state().registry.is_active(topic)
    }

    /// Newest `count` messages (all for `None`), oldest first.
    pub fn get_recent_messages(&self, count: Option<usize>) -> Vec<Message> {
        self.inner.pipeline.get_recent_messages(count)
    }

    pub fn get_message_statistics(&self) -> StatisticsSnapshot {
        self.inner.pipeline.get_statistics()
    }

    pub fn clear_message_history(&self) {
        self.inner.pipeline.clear_history();
    }

    pub fn clear_message_statistics(&self) {
        self.inner.pipeline.clear_statistics();
    }

    pub fn get_connection_info(&self) -> ConnectionInfo {
        let mut info = {
            let state = self.inner.lock_state();
            let target = state.target.as_ref();

            ConnectionInfo {
                status: state.status,
                host: target.map(|t| t.host.clone()),
                port: target.map(|t| t.port),
                username: target
                    .and_then(|t| t.credentials.as_ref())
                    .map(|c| c.username.clone()),
                client_id: self.inner.client_id.clone(),
                connection_attempts: state.connection_attempts,
                reconnect_attempts: state.backoff.attempt(),
                auto_reconnect: state.auto_reconnect,
                last_error: state.last_error.clone(),
                subscribed_topics: state.registry.active(),
                pending_topics: state.registry.pending_topics(),
                total_messages: 0,
                messages_per_second: 0.0,
                active_topics: 0,
            }
        };

        let stats = self.inner.pipeline.get_statistics();
        info.total_messages = stats.total_messages;
        info.messages_per_second = stats.messages_per_second;
        info.active_topics = stats.active_topics;
        info
    }

    pub fn get_status(&self) -> ConnectionStatus {
        self.inner.lock_state().status
    }

    pub fn is_connected(&self) -> bool {
        self.get_status().is_connected()
    }

    pub fn get_last_error(&self) -> Option<String> {
        self.inner.lock_state().last_error.clone()
    }

    /// Enables or disables automatic reconnection. Disabling cancels a
    /// pending reconnect.
    pub fn set_auto_reconnect(&self, enabled: bool) {
        let mut state = self.inner.lock_state();
        state.auto_reconnect = enabled;
        if !enabled {
            self.inner.cancel_reconnect_timer(&mut state);
        }
        info!(
            "Auto-reconnect {}",
            if enabled { "enabled" } else { "disabled" }
        );
    }

    pub fn is_auto_reconnect_enabled(&self) -> bool {
        self.inner.lock_state().auto_reconnect
    }

    /// Reconnect attempts scheduled since the last successful connect.
    pub fn get_reconnect_attempts(&self) -> u32 {
        self.inner.lock_state().backoff.attempt()
    }

    /// Whether a reconnect timer is currently armed.
    pub fn has_pending_reconnect(&self) -> bool {
        self.inner
            .lock_state()
            .reconnect_timer
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    pub fn is_processing(&self) -> bool {
        self.inner.pipeline.is_running()
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn on_status_change<F>(&self, f: F)
    where
        F: Fn(&ConnectionStatus) + Send + Sync + 'static,
    {
        self.inner.events.on_status_change(f);
    }

    pub fn on_message<F>(&self, f: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.inner.events.on_message(f);
    }

    pub fn on_connected<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.events.on_connected(f);
    }

    pub fn on_error<F>(&self, f: F)
    where
        F: Fn(&String) + Send + Sync + 'static,
    {
        self.inner.events.on_error(f);
    }

    pub fn on_queue_full<F>(&self, f: F)
    where
        F: Fn(&usize) + Send + Sync + 'static,
    {
        self.inner.events.on_queue_full(f);
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.events.subscribe_status()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe_events()
    }
}

impl SessionInner {
    fn lock_state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, notification: Notification) {
        // Only fails once the dispatcher is gone, i.e. at runtime shutdown.
        let _ = self.notify_tx.send(notification);
    }

    fn set_status(&self, state: &mut ConnectionState, status: ConnectionStatus) {
        if state.status == status {
            return;
        }
        info!(from = %state.status, to = %status, "Connection state changed");
        state.status = status;
        self.notify(Notification::Status(status));
    }

    fn record_error(&self, state: &mut ConnectionState, message: String) {
        state.last_error = Some(message.clone());
        self.notify(Notification::Error(message));
    }

    fn cancel_reconnect_timer(&self, state: &mut ConnectionState) {
        if let Some(timer) = state.reconnect_timer.take() {
            timer.cancel.cancel();
            debug!("Reconnect timer cancelled");
        }
    }

    fn handler(&self) -> Arc<dyn ProtocolHandler> {
        Arc::new(SessionHandler {
            inner: self.self_ref.clone(),
        })
    }

    /// Shared tail of user connects and timer reconnects.
    fn connect_locked(
        &self,
        state: &mut ConnectionState,
        target: BrokerTarget,
    ) -> Result<(), SessionError> {
        self.cancel_reconnect_timer(state);

        let request = ConnectRequest {
            host: target.host.clone(),
            port: target.port,
            keep_alive: self.config.keep_alive_duration(),
            credentials: target.credentials.clone(),
            client_id: self.client_id.clone(),
        };
        state.target = Some(target);
        state.connection_attempts += 1;
        self.set_status(state, ConnectionStatus::Connecting);

        info!(
            "Attempting to connect to {}:{} (attempt {})",
            request.host, request.port, state.connection_attempts
        );

        match self.protocol.connect(&request, self.handler()) {
            Ok(()) => {
                // Still running after a dropped connection.
                self.pipeline.ensure_processing();
                Ok(())
            }
            Err(e) => {
                let message = format!("Connection error: {e}");
                error!("{message}");
                self.record_error(state, message.clone());
                self.set_status(state, ConnectionStatus::ConnectionFailed);
                self.schedule_reconnect(state);
                Err(SessionError::NetworkFailure(message))
            }
        }
    }

    fn schedule_reconnect(&self, state: &mut ConnectionState) {
        if !state.auto_reconnect {
            debug!("Auto-reconnect disabled, not scheduling");
            return;
        }
        if state.target.is_none() {
            debug!("No previous broker target, not scheduling reconnect");
            return;
        }

        let delay = match state.backoff.next_sleep() {
            Ok(delay) => delay,
            Err(e) => {
                error!("{e}");
                self.record_error(state, e.to_string());
                return;
            }
        };

        self.cancel_reconnect_timer(state);

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let weak = self.self_ref.clone();
        let handle = self.runtime.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Some(inner) = weak.upgrade() {
                        inner.attempt_reconnect(&token);
                    }
                }
            }
        });

        state.reconnect_timer = Some(ReconnectTimer { handle, cancel });
        info!(
            "Scheduling reconnection attempt {} in {:.1} seconds",
            state.backoff.attempt(),
            delay.as_secs_f64()
        );
    }

    fn attempt_reconnect(&self, token: &CancellationToken) {
        let mut state = self.lock_state();

        // Cancelled between the timer firing and us getting the lock.
        if token.is_cancelled() {
            return;
        }
        state.reconnect_timer = None;

        if !matches!(
            state.status,
            ConnectionStatus::ConnectionFailed | ConnectionStatus::ConnectionLost
        ) {
            debug!(status = %state.status, "Skipping reconnect");
            return;
        }

        let Some(target) = state.target.clone() else {
            error!("Cannot reconnect: no previous connection settings available");
            return;
        };

        info!(
            "Attempting automatic reconnection to {}:{}",
            target.host, target.port
        );
        // A synchronous failure reschedules inside connect_locked.
        let _ = self.connect_locked(&mut state, target);
    }

    async fn disconnect(&self) -> Result<(), SessionError> {
        self.cancel_reconnect_timer(&mut self.lock_state());

        if let Err(e) = self
            .pipeline
            .stop_processing(self.config.queue.shutdown_timeout())
            .await
        {
            warn!("{e}");
        }

        let was_open = {
            let mut state = self.lock_state();
            // A callback may have re-armed the timer while the worker stopped.
            self.cancel_reconnect_timer(&mut state);

            let was_open = state.status.has_open_session();
            if was_open {
                info!("Disconnecting from MQTT broker");
                if let Err(e) = self.protocol.disconnect() {
                    let message = format!("Disconnect failed: {e}");
                    error!("{message}");
                    self.record_error(&mut state, message);
                    self.set_status(&mut state, ConnectionStatus::Disconnected);
                    return Err(e);
                }
            }

            self.set_status(&mut state, ConnectionStatus::Disconnected);
            was_open
        };

        if was_open {
            tokio::time::sleep(DISCONNECT_SETTLE).await;
        }
        Ok(())
    }

    fn subscribe(&self, topic: &str, qos: u8) -> Result<(), SessionError> {
        qos_from_u8(qos)?;
        let mut state = self.lock_state();

        if !state.status.is_connected() {
            if state.registry.queue_pending(topic, qos) {
                info!("Queued topic subscription: {topic}");
            } else {
                debug!("Topic already queued or subscribed: {topic}");
            }
            return Ok(());
        }

        match self.protocol.subscribe(topic, qos) {
            Ok(()) => {
                state.registry.mark_active(topic, qos);
                info!("Subscribed to topic: {topic} (QoS: {qos})");
                Ok(())
            }
            Err(e) => {
                let message = format!("Failed to subscribe to {topic}: {e}");
                error!("{message}");
                self.record_error(&mut state, message);
                Err(e)
            }
        }
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), SessionError> {
        let mut state = self.lock_state();

        if !state.status.is_connected() {
            error!("Cannot unsubscribe from {topic}: not connected to broker");
            return Err(SessionError::NotConnected);
        }

        match self.protocol.unsubscribe(topic) {
            Ok(()) => {
                state.registry.remove_active(topic);
                info!("Unsubscribed from topic: {topic}");
                Ok(())
            }
            Err(e) => {
                let message = format!("Failed to unsubscribe from {topic}: {e}");
                error!("{message}");
                self.record_error(&mut state, message);
                Err(e)
            }
        }
    }

    /// Re-issues active subscriptions and flushes pending ones as a single
    /// batch, so the whole set takes one slot in the client's request queue.
    fn restore_subscriptions(&self, state: &mut ConnectionState) {
        let active = state.registry.active_entries();
        let pending = state.registry.pending_entries();
        if active.is_empty() && pending.is_empty() {
            return;
        }

        let batch: Vec<(String, u8)> = active.iter().chain(pending.iter()).cloned().collect();
        info!(
            "Restoring {} subscriptions and flushing {} pending",
            active.len(),
            pending.len()
        );

        match self.protocol.subscribe_many(&batch) {
            Ok(()) => {
                for (topic, qos) in pending {
                    state.registry.mark_active(&topic, qos);
                    info!("Subscribed to topic: {topic} (QoS: {qos})");
                }
            }
            Err(e) => {
                warn!("Subscription restore failed, keeping {} topics pending: {e}", batch.len());
                for (topic, _) in active {
                    state.registry.demote(&topic);
                }
            }
        }
    }

    fn handle_subscribe_rejected(&self, topic: String) {
        let mut state = self.lock_state();

        if state.registry.remove_active(&topic).is_none() {
            debug!("Rejected subscription was no longer active: {topic}");
        }

        let message = SessionError::ProtocolFailure {
            code: SUBACK_FAILURE,
            reason: format!("Broker rejected subscription to {topic}"),
        }
        .to_string();
        error!("{message}");
        self.record_error(&mut state, message);
    }

    fn handle_connack(&self, code: u8) {
        let mut state = self.lock_state();

        if state.status != ConnectionStatus::Connecting {
            debug!(code, status = %state.status, "Ignoring CONNACK outside Connecting");
            return;
        }

        if code == 0 {
            self.set_status(&mut state, ConnectionStatus::Connected);
            state.connection_attempts = 0;
            state.backoff.reset();
            state.last_error = None;
            self.cancel_reconnect_timer(&mut state);

            if let Some(target) = &state.target {
                info!("Connected to MQTT broker {}:{}", target.host, target.port);
            }

            self.restore_subscriptions(&mut state);
            self.notify(Notification::Connected);
        } else {
            let message = format!(
                "Connection failed with code {code}: {}",
                connack_reason(code)
            );
            error!("{message}");
            self.record_error(&mut state, message);
            self.set_status(&mut state, ConnectionStatus::ConnectionFailed);
            self.schedule_reconnect(&mut state);
        }
    }

    fn handle_connect_failure(&self, reason: String) {
        let mut state = self.lock_state();

        if state.status == ConnectionStatus::Disconnected {
            debug!("Ignoring connect failure while disconnected: {reason}");
            return;
        }

        let message = format!("Failed to establish connection to MQTT broker: {reason}");
        error!("{message}");
        self.record_error(&mut state, message);
        self.set_status(&mut state, ConnectionStatus::ConnectionFailed);
        self.schedule_reconnect(&mut state);
    }

    fn handle_disconnect(&self, reason: DisconnectReason) {
        let mut state = self.lock_state();

        match reason {
            DisconnectReason::Requested => {
                self.set_status(&mut state, ConnectionStatus::Disconnected);
                self.cancel_reconnect_timer(&mut state);
                info!("Disconnected from MQTT broker");
            }
            DisconnectReason::Unexpected(reason) => {
                if !state.status.has_open_session() {
                    debug!(status = %state.status, "Ignoring drop without an open session: {reason}");
                    return;
                }

                let message = format!("Unexpected disconnection from MQTT broker: {reason}");
                warn!("{message}");
                self.record_error(&mut state, message);
                self.set_status(&mut state, ConnectionStatus::ConnectionLost);
                self.schedule_reconnect(&mut state);
            }
        }
    }

    fn handle_message(&self, delivery: Delivery) {
        if let Err(e) = self.pipeline.add_message(delivery) {
            warn!("{e}");
        }
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = state.reconnect_timer.take() {
            timer.cancel.cancel();
        }
    }
}

/// Protocol callbacks routed into the session. Holds the session weakly so a
/// running driver does not keep a dropped session alive.
struct SessionHandler {
    inner: Weak<SessionInner>,
}

impl ProtocolHandler for SessionHandler {
    fn on_connect(&self, code: u8) {
        if let Some(inner) = self.inner.upgrade() {
            inner.handle_connack(code);
        }
    }

    fn on_disconnect(&self, reason: DisconnectReason) {
        if let Some(inner) = self.inner.upgrade() {
            inner.handle_disconnect(reason);
        }
    }

    fn on_message(&self, delivery: Delivery) {
        if let Some(inner) = self.inner.upgrade() {
            inner.handle_message(delivery);
        }
    }

    fn on_connect_failure(&self, reason: String) {
        if let Some(inner) = self.inner.upgrade() {
            inner.handle_connect_failure(reason);
        }
    }

    fn on_subscribe_rejected(&self, topic: String) {
        if let Some(inner) = self.inner.upgrade() {
            inner.handle_subscribe_rejected(topic);
        }
    }
}

async fn dispatch_notifications(
    mut rx: mpsc::UnboundedReceiver<Notification>,
    events: Arc<EventHub>,
) {
    while let Some(notification) = rx.recv().await {
        match notification {
            Notification::Status(status) => events.publish_status(status),
            Notification::Connected => events.publish_connected(),
            Notification::Error(message) => events.publish_error(&message),
        }
    }
    debug!("Notification dispatcher stopped");
}
