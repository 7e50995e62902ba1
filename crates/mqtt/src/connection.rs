//! rumqttc-backed implementation of [`ProtocolClient`].
//!
//! Every accepted `connect` builds a fresh `AsyncClient`/`EventLoop` pair and
//! spawns an [`EventLoopDriver`] that polls the event loop and translates what
//! it sees into [`ProtocolHandler`] callbacks:
//!
//! ```text
//! EventLoop::poll()
//!     ├─ Ok(ConnAck)                ─▶ on_connect(0)
//!     ├─ Ok(Publish)                ─▶ on_message(delivery)
//!     ├─ Ok(SubAck with 0x80)       ─▶ on_subscribe_rejected(topic)
//!     ├─ Ok(Disconnect from broker) ─▶ on_disconnect(Unexpected)
//!     ├─ Err(ConnectionRefused(rc)) ─▶ on_connect(rc)
//!     ├─ Err(_) before CONNACK      ─▶ on_connect_failure(reason)
//!     └─ Err(_) after CONNACK       ─▶ on_disconnect(Unexpected)
//! cancel (disconnect requested)     ─▶ on_disconnect(Requested)
//! ```
//!
//! The driver stops at the first error. It never retries on its own: the
//! session's backoff decides when the next `connect` happens. Callbacks from a
//! driver that has been superseded by a newer `connect` are dropped.
//!
//! SUBACKs only carry a packet id, so every subscribe request records its
//! topics in a FIFO before it enters the request channel. The event loop emits
//! `Outgoing::Subscribe(pkid)` in request order, which lets the driver pair
//! each packet id with its topics and name the ones the broker refused.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Outgoing, Packet, Publish,
    SubscribeFilter, SubscribeReasonCode,
};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{
    client::ClientBuilder,
    config::Config,
    error::SessionError,
    protocol::{ConnectRequest, Delivery, DisconnectReason, ProtocolClient, ProtocolHandler},
    topic::{qos_from_u8, qos_to_u8},
};

/// How long a requested disconnect may spend flushing the DISCONNECT packet.
const DISCONNECT_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Topics of each queued subscribe request, oldest first.
type SubscribeQueue = Arc<Mutex<VecDeque<Vec<String>>>>;

fn lock_queue(queue: &SubscribeQueue) -> MutexGuard<'_, VecDeque<Vec<String>>> {
    queue.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ActiveConnection {
    client: AsyncClient,
    cancel: CancellationToken,
    subscribes: SubscribeQueue,
}

impl ActiveConnection {
    /// Queues one SUBSCRIBE packet carrying `filters`.
    fn send_subscribe(&self, filters: Vec<SubscribeFilter>) -> Result<(), SessionError> {
        let topics = filters.iter().map(|f| f.path.clone()).collect();

        // Held across the send so the driver never sees the packet first.
        let mut queued = lock_queue(&self.subscribes);
        queued.push_back(topics);
        if let Err(e) = self.client.try_subscribe_many(filters) {
            queued.pop_back();
            return Err(e.into());
        }
        Ok(())
    }
}

/// MQTT 3.1.1 protocol client over rumqttc.
pub struct MqttProtocol {
    config: Config,
    runtime: Handle,
    active: Mutex<Option<ActiveConnection>>,

    /// Bumped on every connect; drivers compare against it before calling back.
    generation: Arc<AtomicU64>,
}

impl MqttProtocol {
    /// Creates a protocol client bound to the current tokio runtime.
    pub fn new(config: Config) -> Result<Self, SessionError> {
        let runtime = Handle::try_current()
            .map_err(|e| SessionError::Runtime(format!("no tokio runtime: {e}")))?;
        Ok(Self::with_handle(config, runtime))
    }

    pub fn with_handle(config: Config, runtime: Handle) -> Self {
        Self {
            config,
            runtime,
            active: Mutex::new(None),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveConnection>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn client(&self) -> Result<AsyncClient, SessionError> {
        self.lock_active()
            .as_ref()
            .map(|active| active.client.clone())
            .ok_or(SessionError::NotConnected)
    }
}

impl ProtocolClient for MqttProtocol {
    fn connect(
        &self,
        request: &ConnectRequest,
        handler: Arc<dyn ProtocolHandler>,
    ) -> Result<(), SessionError> {
        let (client, event_loop) = ClientBuilder::from_request(request, &self.config).build()?;

        let mut active = self.lock_active();
        if let Some(previous) = active.take() {
            debug!("Superseding previous connection driver");
            previous.cancel.cancel();
        }

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let cancel = CancellationToken::new();
        let subscribes = SubscribeQueue::default();

        let driver = EventLoopDriver {
            event_loop,
            handler,
            cancel: cancel.clone(),
            generation,
            current_generation: self.generation.clone(),
            connected: false,
            subscribes: subscribes.clone(),
            in_flight: HashMap::new(),
        };
        self.runtime.spawn(driver.run());

        *active = Some(ActiveConnection {
            client,
            cancel,
            subscribes,
        });

        info!(
            host = %request.host,
            port = request.port,
            client_id = %request.client_id,
            "Connection driver started"
        );
        Ok(())
    }

    fn disconnect(&self) -> Result<(), SessionError> {
        let Some(active) = self.lock_active().take() else {
            debug!("Disconnect requested with no active connection");
            return Ok(());
        };

        let result = active.client.try_disconnect();
        // The driver flushes the DISCONNECT packet before it stops.
        active.cancel.cancel();

        result.map_err(|e| {
            warn!("Error queueing disconnect packet: {e}");
            SessionError::from(e)
        })
    }

    fn subscribe(&self, topic: &str, qos: u8) -> Result<(), SessionError> {
        let qos = qos_from_u8(qos)?;
        let active = self.lock_active();
        let active = active.as_ref().ok_or(SessionError::NotConnected)?;
        active.send_subscribe(vec![SubscribeFilter::new(topic.to_string(), qos)])?;
        debug!(topic, ?qos, "Subscribe request queued");
        Ok(())
    }

    fn subscribe_many(&self, topics: &[(String, u8)]) -> Result<(), SessionError> {
        let filters = topics
            .iter()
            .map(|(topic, qos)| Ok(SubscribeFilter::new(topic.clone(), qos_from_u8(*qos)?)))
            .collect::<Result<Vec<_>, SessionError>>()?;

        let active = self.lock_active();
        let active = active.as_ref().ok_or(SessionError::NotConnected)?;

        let batches = subscribe_batches(filters, self.config.max_packet_size);
        let packets = batches.len();
        for batch in batches {
            active.send_subscribe(batch)?;
        }
        debug!(topics = topics.len(), packets, "Subscribe batch queued");
        Ok(())
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), SessionError> {
        self.client()?.try_unsubscribe(topic)?;
        debug!(topic, "Unsubscribe request queued");
        Ok(())
    }
}

impl Drop for MqttProtocol {
    fn drop(&mut self) {
        if let Some(active) = self.lock_active().take() {
            active.cancel.cancel();
        }
    }
}

/// Polls one event loop until it fails, is cancelled, or is superseded.
struct EventLoopDriver {
    event_loop: EventLoop,
    handler: Arc<dyn ProtocolHandler>,
    cancel: CancellationToken,
    generation: u64,
    current_generation: Arc<AtomicU64>,
    connected: bool,
    subscribes: SubscribeQueue,
    /// Topics of sent SUBSCRIBE packets awaiting their SUBACK.
    in_flight: HashMap<u16, Vec<String>>,
}

impl EventLoopDriver {
    fn is_current(&self) -> bool {
        self.current_generation.load(Ordering::Acquire) == self.generation
    }

    async fn run(mut self) {
        debug!(generation = self.generation, "Event loop driver running");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.flush_disconnect().await;
                    if self.is_current() {
                        self.handler.on_disconnect(DisconnectReason::Requested);
                    }
                    break;
                }

                event_result = self.event_loop.poll() => {
                    if !self.is_current() {
                        trace!(generation = self.generation, "Stale driver exiting");
                        break;
                    }

                    match event_result {
                        Ok(event) => {
                            if !self.handle_event(event) {
                                break;
                            }
                        }
                        Err(e) => {
                            self.handle_error(e);
                            break;
                        }
                    }
                }
            }
        }

        debug!(generation = self.generation, "Event loop driver stopped");
    }

    /// Returns `false` when the driver should stop.
    fn handle_event(&mut self, event: Event) -> bool {
        match event {
            Event::Incoming(Packet::ConnAck(conn_ack)) => {
                let code = connect_code(conn_ack.code);
                if code == 0 {
                    self.connected = true;
                }
                self.handler.on_connect(code);
                code == 0
            }
            Event::Incoming(Packet::Publish(publish)) => {
                trace!(topic = %publish.topic, bytes = publish.payload.len(), "Received publish");
                self.handler.on_message(delivery_from(publish));
                true
            }
            Event::Incoming(Packet::Disconnect) => {
                warn!("Disconnected by broker");
                self.handler
                    .on_disconnect(DisconnectReason::Unexpected("Disconnected by broker".into()));
                false
            }
            Event::Incoming(Packet::SubAck(sub_ack)) => {
                let topics = self.in_flight.remove(&sub_ack.pkid).unwrap_or_default();
                for (index, code) in sub_ack.return_codes.iter().enumerate() {
                    if !matches!(code, SubscribeReasonCode::Failure) {
                        continue;
                    }
                    match topics.get(index) {
                        Some(topic) => {
                            warn!(pkid = sub_ack.pkid, topic, "Broker rejected subscription");
                            self.handler.on_subscribe_rejected(topic.clone());
                        }
                        None => warn!(pkid = sub_ack.pkid, index, "Broker rejected unknown subscription"),
                    }
                }
                true
            }
            Event::Incoming(Packet::PingResp) | Event::Incoming(Packet::PingReq) => true,
            Event::Incoming(packet) => {
                trace!("Incoming packet: {:?}", packet);
                true
            }
            Event::Outgoing(Outgoing::Subscribe(pkid)) => {
                match lock_queue(&self.subscribes).pop_front() {
                    Some(topics) => {
                        trace!(pkid, topics = topics.len(), "Subscribe sent");
                        self.in_flight.insert(pkid, topics);
                    }
                    None => warn!(pkid, "Subscribe sent without a queued request"),
                }
                true
            }
            Event::Outgoing(outgoing) => {
                trace!("Outgoing packet: {:?}", outgoing);
                true
            }
        }
    }

    fn handle_error(&mut self, e: ConnectionError) {
        let message = get_error_message(&e);

        if is_fatal_error(&e) {
            error!("Connection error that retrying is unlikely to fix: {message}");
        } else {
            warn!("Connection error: {message}");
        }

        match e {
            ConnectionError::ConnectionRefused(code) => {
                self.handler.on_connect(connect_code(code));
            }
            _ if self.connected => {
                self.handler
                    .on_disconnect(DisconnectReason::Unexpected(message));
            }
            _ => self.handler.on_connect_failure(message),
        }
    }

    /// Lets the event loop send the queued DISCONNECT packet.
    async fn flush_disconnect(&mut self) {
        if !self.connected {
            return;
        }

        let flushed = tokio::time::timeout(DISCONNECT_FLUSH_TIMEOUT, async {
            loop {
                match self.event_loop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
        })
        .await;

        if flushed.is_err() {
            debug!("Timed out flushing disconnect packet");
        }
    }
}

/// Splits `filters` into groups that each fit one SUBSCRIBE packet of at most
/// `max_packet_size` bytes. A filter too large on its own still gets a group.
fn subscribe_batches(
    filters: Vec<SubscribeFilter>,
    max_packet_size: usize,
) -> Vec<Vec<SubscribeFilter>> {
    // fixed header (up to 5 bytes) + packet id
    let budget = max_packet_size.saturating_sub(7);

    let mut batches = Vec::new();
    let mut current = Vec::new();
    let mut size = 0;
    for filter in filters {
        // length prefix + topic + requested QoS
        let len = filter.path.len() + 3;
        if !current.is_empty() && size + len > budget {
            batches.push(std::mem::take(&mut current));
            size = 0;
        }
        size += len;
        current.push(filter);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

fn delivery_from(publish: Publish) -> Delivery {
    Delivery {
        topic: publish.topic,
        payload: publish.payload.to_vec(),
        qos: qos_to_u8(publish.qos),
        retain: publish.retain,
        pkid: (publish.pkid != 0).then_some(publish.pkid),
    }
}

/// Numeric MQTT 3.1.1 CONNACK return code.
fn connect_code(code: ConnectReturnCode) -> u8 {
    match code {
        ConnectReturnCode::Success => 0,
        ConnectReturnCode::RefusedProtocolVersion => 1,
        ConnectReturnCode::BadClientId => 2,
        ConnectReturnCode::ServiceUnavailable => 3,
        ConnectReturnCode::BadUserNamePassword => 4,
        ConnectReturnCode::NotAuthorized => 5,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Fatal,
    Reconnect,
}

fn classify_connection_error(err: &ConnectionError) -> Disposition {
    use Disposition::*;

    match err {
        // Broken certificates or crypto setup
        ConnectionError::Tls(_) => Fatal,
        ConnectionError::MqttState(_) => Fatal,
        ConnectionError::NotConnAck(_) => Fatal,
        ConnectionError::RequestsDone => Fatal,

        ConnectionError::Io(e) => match e.kind() {
            std::io::ErrorKind::AddrInUse
            | std::io::ErrorKind::PermissionDenied
            | std::io::ErrorKind::InvalidInput
            | std::io::ErrorKind::InvalidData => Fatal,
            _ => Reconnect,
        },

        ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => Reconnect,

        ConnectionError::ConnectionRefused(code) => match code {
            ConnectReturnCode::RefusedProtocolVersion
            | ConnectReturnCode::BadClientId
            | ConnectReturnCode::BadUserNamePassword
            | ConnectReturnCode::NotAuthorized => Fatal,
            _ => Reconnect,
        },

        #[allow(unreachable_patterns)]
        _ => Reconnect,
    }
}

fn is_fatal_error(err: &ConnectionError) -> bool {
    matches!(classify_connection_error(err), Disposition::Fatal)
}

/// Innermost message of an error's source chain.
fn get_error_message(e: &dyn std::error::Error) -> String {
    let mut current = e;
    while let Some(source) = current.source() {
        current = source;
    }
    let msg = current.to_string();
    msg.trim_matches('"').to_string()
}
