//! Periodic statistics reporting.
//!
//! The `Reporter` waits until the session is ready, then logs a summary of
//! the ingested traffic every `interval` seconds: totals, current rate,
//! busiest topics and, at debug level, the newest messages.

use std::sync::Arc;

use mqviz_mqtt::{message::now_secs, Message, Session, StatisticsSnapshot};
use serde::Serialize;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, info, warn};

use super::readiness::Readiness;
use crate::config::reporter::ReporterConfig;

/// Read side of the session the reporter needs.
pub trait StatisticsSource: Send + Sync {
    fn statistics(&self) -> StatisticsSnapshot;

    /// Newest `count` messages, oldest first.
    fn recent_messages(&self, count: usize) -> Vec<Message>;
}

impl StatisticsSource for Session {
    fn statistics(&self) -> StatisticsSnapshot {
        self.get_message_statistics()
    }

    fn recent_messages(&self, count: usize) -> Vec<Message> {
        self.get_recent_messages(Some(count))
    }
}

/// One statistics report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub total_messages: u64,
    /// Messages ingested since the previous report.
    pub new_messages: u64,
    pub messages_per_second: f64,
    pub queue_size: usize,
    pub history_size: usize,
    pub active_topics: usize,
    /// Busiest topics, highest count first.
    pub top_topics: Vec<(String, u64)>,
    /// Seconds since the newest message.
    pub idle_secs: Option<f64>,
}

impl Report {
    pub fn from_snapshot(stats: &StatisticsSnapshot, previous_total: u64, top: usize) -> Self {
        let mut topics: Vec<(String, u64)> = stats
            .topic_stats
            .iter()
            .map(|(topic, count)| (topic.clone(), *count))
            .collect();
        // BTreeMap order keeps ties alphabetical under a stable sort
        topics.sort_by(|a, b| b.1.cmp(&a.1));
        topics.truncate(top);

        Self {
            total_messages: stats.total_messages,
            // Statistics may have been cleared since the last report.
            new_messages: stats.total_messages.saturating_sub(previous_total),
            messages_per_second: stats.messages_per_second,
            queue_size: stats.queue_size,
            history_size: stats.history_size,
            active_topics: stats.active_topics,
            top_topics: topics,
            idle_secs: stats
                .last_message_time
                .map(|last| (now_secs() - last).max(0.0)),
        }
    }
}

/// Logs traffic statistics on a fixed interval.
pub struct Reporter {
    source: Arc<dyn StatisticsSource>,
    config: ReporterConfig,
    readiness: Readiness,
}

impl Reporter {
    pub fn new(
        source: Arc<dyn StatisticsSource>,
        config: ReporterConfig,
        readiness: Readiness,
    ) -> Self {
        Self {
            source,
            config,
            readiness,
        }
    }

    async fn wait_until_ready(&self) {
        let mut rx = self.readiness.subscribe();
        if rx.borrow().is_ready() {
            info!("Session is already connected, starting statistics reporting");
            return;
        }

        warn!("Waiting for broker connection... Current: {}", *rx.borrow());
        loop {
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        warn!("Readiness channel closed, reporting anyway");
                        return;
                    }
                    let state = rx.borrow().clone();
                    if state.is_ready() {
                        info!("Session connected, starting statistics reporting");
                        return;
                    }
                    debug!("Still not ready: {}", state);
                }
                _ = sleep(Duration::from_secs(30)) => {
                    warn!("Still waiting for broker connection... Current: {}", *rx.borrow());
                }
            }
        }
    }

    /// Builds the next report and logs it.
    pub fn report_once(&self, previous_total: u64) -> Report {
        let stats = self.source.statistics();
        let report = Report::from_snapshot(&stats, previous_total, self.config.top_topics);

        info!(
            total = report.total_messages,
            new = report.new_messages,
            rate = report.messages_per_second,
            queue = report.queue_size,
            history = report.history_size,
            topics = report.active_topics,
            "Traffic statistics"
        );

        for (topic, count) in &report.top_topics {
            info!("  {:>8}  {}", count, topic);
        }

        if self.config.recent_messages > 0 {
            for message in self.source.recent_messages(self.config.recent_messages) {
                debug!(
                    topic = %message.topic,
                    qos = message.qos,
                    retain = message.retain,
                    "{}",
                    message.payload
                );
            }
        }

        if let Ok(json) = serde_json::to_string(&report) {
            debug!("Report: {}", json);
        }

        report
    }

    /// Runs the reporting loop indefinitely.
    pub async fn run(self) -> ! {
        self.wait_until_ready().await;

        let interval = Duration::from_secs(self.config.interval);
        info!(
            "Statistics reporting started (interval: {}s)",
            self.config.interval
        );

        let mut previous_total = 0;
        loop {
            let start = Instant::now();
            previous_total = self.report_once(previous_total).total_messages;

            let elapsed = start.elapsed();
            if elapsed < interval {
                sleep(interval - elapsed).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use tracing_test::traced_test;

    use super::*;
    use crate::core::readiness::ReadinessState;

    #[derive(Default)]
    struct MockSource {
        stats: Mutex<StatisticsSnapshot>,
        reads: AtomicUsize,
    }

    impl MockSource {
        fn with_topics(topics: &[(&str, u64)]) -> Self {
            let topic_stats: BTreeMap<String, u64> =
                topics.iter().map(|(t, c)| (t.to_string(), *c)).collect();
            let source = Self::default();
            {
                let mut stats = source.stats.lock().unwrap();
                stats.total_messages = topic_stats.values().sum();
                stats.active_topics = topic_stats.len();
                stats.topic_stats = topic_stats;
            }
            source
        }

        fn reads(&self) -> usize {
            self.reads.load(Ordering::SeqCst)
        }
    }

    impl StatisticsSource for MockSource {
        fn statistics(&self) -> StatisticsSnapshot {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.stats.lock().unwrap().clone()
        }

        fn recent_messages(&self, count: usize) -> Vec<Message> {
            (0..count)
                .map(|i| Message {
                    topic: "recent".into(),
                    payload: format!("payload-{i}"),
                    timestamp: 0.0,
                    qos: 0,
                    retain: false,
                    id: None,
                })
                .collect()
        }
    }

    fn config(interval: u64) -> ReporterConfig {
        ReporterConfig {
            interval,
            recent_messages: 2,
            top_topics: 2,
        }
    }

    #[test]
    fn test_top_topics_ordering() {
        let source = MockSource::with_topics(&[("b", 5), ("a", 5), ("c", 9), ("d", 1)]);
        let report = Report::from_snapshot(&source.statistics(), 4, 3);

        assert_eq!(
            report.top_topics,
            vec![("c".to_string(), 9), ("a".to_string(), 5), ("b".to_string(), 5)]
        );
        assert_eq!(report.total_messages, 20);
        assert_eq!(report.new_messages, 16);
        assert_eq!(report.idle_secs, None);
    }

    #[test]
    fn test_new_messages_after_clear() {
        let source = MockSource::with_topics(&[("a", 3)]);
        let report = Report::from_snapshot(&source.statistics(), 100, 5);
        assert_eq!(report.new_messages, 0);
    }

    #[test]
    #[traced_test]
    fn test_report_once_logs_recent_messages() {
        let mut reporter_config = config(1);
        reporter_config.recent_messages = 1;
        let source = Arc::new(MockSource::with_topics(&[("sensors/a", 2)]));
        let reporter = Reporter::new(source, reporter_config, Readiness::new());

        let report = reporter.report_once(0);
        assert_eq!(report.new_messages, 2);
        assert!(logs_contain("Traffic statistics"));
        assert!(logs_contain("sensors/a"));
        assert!(logs_contain("payload-0"));
    }

    #[tokio::test]
    #[traced_test]
    async fn reporter_waits_for_ready_state() {
        let readiness = Readiness::new();
        readiness.set_state(ReadinessState::NotReadyYet("test".into()));

        let source = Arc::new(MockSource::with_topics(&[("a", 1)]));
        let reporter = Reporter::new(source.clone(), config(1), readiness.clone());
        let handle = tokio::spawn(async move {
            reporter.run().await;
        });

        sleep(Duration::from_millis(300)).await;
        assert_eq!(source.reads(), 0);

        readiness.set_state(ReadinessState::Ready);
        sleep(Duration::from_millis(300)).await;

        assert!(source.reads() > 0);
        assert!(logs_contain("Session connected, starting statistics reporting"));
        handle.abort();
    }

    #[tokio::test]
    async fn reporter_repeats_on_interval() {
        let readiness = Readiness::new();
        readiness.set_state(ReadinessState::Ready);

        let source = Arc::new(MockSource::default());
        let reporter = Reporter::new(source.clone(), config(1), readiness);
        let handle = tokio::spawn(async move {
            reporter.run().await;
        });

        sleep(Duration::from_millis(2300)).await;
        assert!(source.reads() >= 2, "Should have reported more than once");
        handle.abort();
    }
}
