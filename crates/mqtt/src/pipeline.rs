//! Message ingestion pipeline.
//!
//! Raw deliveries from the protocol client are stamped, decoded and pushed
//! onto a bounded queue without blocking. A single worker task drains the
//! queue, updating history and statistics under the data lock, then hands
//! each message to the message observers and the event stream after the
//! lock is released.
//!
//! ```text
//! on_message ──add_message──▶ IncomingQueue ──worker──▶ [data lock] history + stats
//!                                                             │
//!                                                             ▼
//!                                                 message observers / events
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{
    buffer::{BoundedHistory, IncomingQueue},
    config::QueueConfig,
    error::SessionError,
    events::EventHub,
    message::{now_secs, Message},
    protocol::Delivery,
    stats::{StatisticsSnapshot, StatisticsTracker},
};

struct PipelineData {
    history: BoundedHistory<Message>,
    stats: StatisticsTracker,
}

struct PipelineShared {
    queue: IncomingQueue<Message>,
    data: Mutex<PipelineData>,
    events: Arc<EventHub>,
    poll_interval: Duration,
}

impl PipelineShared {
    fn lock_data(&self) -> MutexGuard<'_, PipelineData> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn process(&self, message: Message) {
        {
            let mut data = self.lock_data();
            data.stats.record(&message.topic, message.timestamp);
            data.history.push(message.clone());
        }

        trace!(topic = %message.topic, "Message processed");
        self.events.publish_message(&message);
    }
}

struct Worker {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
    /// Cancelled when the worker task returns or unwinds.
    exited: CancellationToken,
}

/// Bounded queue, history and statistics plus the worker that connects them.
pub struct IngestionPipeline {
    shared: Arc<PipelineShared>,
    worker: Mutex<Option<Worker>>,
    runtime: Handle,
}

impl IngestionPipeline {
    pub fn new(config: &QueueConfig, events: Arc<EventHub>, runtime: Handle) -> Self {
        let shared = PipelineShared {
            queue: IncomingQueue::new(config.max_queue_size),
            data: Mutex::new(PipelineData {
                history: BoundedHistory::new(config.max_history),
                stats: StatisticsTracker::new(config.rate_window as f64),
            }),
            events,
            poll_interval: config.poll_interval(),
        };

        Self {
            shared: Arc::new(shared),
            worker: Mutex::new(None),
            runtime,
        }
    }

    fn lock_worker(&self) -> MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stamps a delivery with the arrival time and queues it.
    ///
    /// Never blocks. When the queue is full the queue-full observers are told
    /// the current size, the oldest queued message is dropped and the push is
    /// retried once.
    pub fn add_message(&self, delivery: Delivery) -> Result<(), SessionError> {
        let message = Message::from_delivery(&delivery, now_secs());
        let queue = &self.shared.queue;

        let Err(message) = queue.try_push(message) else {
            return Ok(());
        };

        let size = queue.len();
        warn!(size, "Incoming queue full, dropping oldest message");
        self.shared.events.publish_queue_full(size);

        queue.evict_oldest();
        queue.try_push(message).map_err(|dropped| {
            error!(topic = %dropped.topic, "Queue still full after eviction, message dropped");
            SessionError::QueueOverflow(size)
        })
    }

    /// Spawns the worker. Warns and does nothing if it is already running.
    pub fn start_processing(&self) {
        if !self.ensure_processing() {
            warn!("Message processing already running");
        }
    }

    /// Spawns the worker unless a live one is already consuming the queue.
    /// Returns whether a new worker was started.
    ///
    /// A worker that was told to stop but has not exited yet does not count
    /// as live. Its replacement waits for it to exit before consuming, so at
    /// most one worker drains the queue at any time.
    pub fn ensure_processing(&self) -> bool {
        let mut slot = self.lock_worker();

        let previous = match slot.as_ref() {
            Some(worker) if worker.handle.is_finished() => None,
            Some(worker) if !worker.cancel.is_cancelled() => return false,
            Some(worker) => Some(worker.exited.clone()),
            None => None,
        };

        let cancel = CancellationToken::new();
        let exited = CancellationToken::new();
        let handle = self.runtime.spawn(run_worker(
            self.shared.clone(),
            cancel.clone(),
            exited.clone(),
            previous,
        ));

        *slot = Some(Worker {
            handle,
            cancel,
            exited,
        });
        info!("Message processing started");
        true
    }

    /// Signals the worker to stop and waits up to `timeout` for it to exit.
    ///
    /// A worker that overruns the timeout is never aborted mid-message. It
    /// stays tracked, so `is_running` keeps reporting it until it exits.
    pub async fn stop_processing(&self, timeout: Duration) -> Result<(), SessionError> {
        let exited = {
            let slot = self.lock_worker();
            let Some(worker) = slot.as_ref() else {
                return Ok(());
            };
            worker.cancel.cancel();
            worker.exited.clone()
        };

        if tokio::time::timeout(timeout, exited.cancelled()).await.is_err() {
            warn!(?timeout, "Message worker did not stop in time");
            return Err(SessionError::WorkerShutdownTimeout(timeout));
        }

        let stopped = {
            let mut slot = self.lock_worker();
            // A start while we waited installs a fresh worker; leave that one alone.
            match slot.take() {
                Some(worker) if worker.cancel.is_cancelled() => Some(worker),
                other => {
                    *slot = other;
                    None
                }
            }
        };

        if let Some(worker) = stopped {
            if let Err(e) = worker.handle.await {
                error!("Message worker ended abnormally: {e}");
                return Ok(());
            }
        }
        info!("Message processing stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.lock_worker()
            .as_ref()
            .is_some_and(|w| !w.handle.is_finished())
    }

    /// Newest `count` messages (all for `None`), oldest first.
    pub fn get_recent_messages(&self, count: Option<usize>) -> Vec<Message> {
        self.shared.lock_data().history.snapshot(count)
    }

    pub fn get_statistics(&self) -> StatisticsSnapshot {
        let mut snapshot = {
            let data = self.shared.lock_data();
            let mut snapshot = data.stats.snapshot();
            snapshot.history_size = data.history.len();
            snapshot
        };
        snapshot.queue_size = self.shared.queue.len();
        snapshot.is_processing = self.is_running();
        snapshot
    }

    pub fn clear_history(&self) {
        self.shared.lock_data().history.clear();
        info!("Message history cleared");
    }

    pub fn clear_statistics(&self) {
        self.shared.lock_data().stats.clear();
        info!("Message statistics cleared");
    }

    /// Number of messages waiting for the worker.
    pub fn queue_len(&self) -> usize {
        self.shared.queue.len()
    }
}

impl Drop for IngestionPipeline {
    fn drop(&mut self) {
        if let Some(worker) = self.lock_worker().take() {
            worker.cancel.cancel();
        }
    }
}

async fn run_worker(
    shared: Arc<PipelineShared>,
    cancel: CancellationToken,
    exited: CancellationToken,
    previous: Option<CancellationToken>,
) {
    let _exited = exited.drop_guard();

    if let Some(previous) = previous {
        debug!("Waiting for the previous message worker to exit");
        previous.cancelled().await;
    }

    debug!("Message worker running");

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            next = shared.queue.pop_timeout(shared.poll_interval) => {
                if let Some(message) = next {
                    shared.process(message);
                }
            }
        }
    }

    debug!("Message worker exiting");
}
