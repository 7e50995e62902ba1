//! Running message statistics and the sliding-window rate estimate.
//!
//! The rate is measured over the timestamps that fall inside the window
//! ending at the newest message:
//!
//! ```text
//! rate = (n - 1) / (newest - oldest)      when n >= 2 and newest > oldest
//! rate = 0                                otherwise
//! ```
//!
//! Ten messages spaced 0.1s apart therefore read as 10 msg/s. A single
//! message, or a burst sharing one timestamp, reads as 0.

use std::collections::{BTreeMap, HashMap, VecDeque};

use serde::{Deserialize, Serialize};

/// Default rate window.
pub const DEFAULT_RATE_WINDOW_SECS: f64 = 60.0;

/// Point-in-time copy of the pipeline's statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub total_messages: u64,
    pub messages_per_second: f64,
    pub queue_size: usize,
    pub history_size: usize,
    pub active_topics: usize,
    pub topic_stats: BTreeMap<String, u64>,
    pub last_message_time: Option<f64>,
    pub is_processing: bool,
}

/// Counters updated once per processed message. Kept under the data lock.
#[derive(Debug, Clone)]
pub struct StatisticsTracker {
    total: u64,
    topic_counts: HashMap<String, u64>,
    window: VecDeque<f64>,
    window_secs: f64,
    rate: f64,
    last_message_time: Option<f64>,
}

impl StatisticsTracker {
    pub fn new(window_secs: f64) -> Self {
        Self {
            total: 0,
            topic_counts: HashMap::new(),
            window: VecDeque::new(),
            window_secs,
            rate: 0.0,
            last_message_time: None,
        }
    }

    /// Accounts for one message.
    pub fn record(&mut self, topic: &str, timestamp: f64) {
        self.total += 1;
        match self.topic_counts.get_mut(topic) {
            Some(count) => *count += 1,
            None => {
                self.topic_counts.insert(topic.to_string(), 1);
            }
        }
        self.last_message_time = Some(timestamp);

        self.window.push_back(timestamp);
        let cutoff = timestamp - self.window_secs;
        while self.window.front().is_some_and(|&oldest| oldest < cutoff) {
            self.window.pop_front();
        }

        self.rate = self.compute_rate();
    }

    fn compute_rate(&self) -> f64 {
        let (Some(&oldest), Some(&newest)) = (self.window.front(), self.window.back()) else {
            return 0.0;
        };
        let span = newest - oldest;
        if self.window.len() >= 2 && span > 0.0 {
            (self.window.len() - 1) as f64 / span
        } else {
            0.0
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn active_topics(&self) -> usize {
        self.topic_counts.len()
    }

    pub fn topic_count(&self, topic: &str) -> u64 {
        self.topic_counts.get(topic).copied().unwrap_or(0)
    }

    pub fn last_message_time(&self) -> Option<f64> {
        self.last_message_time
    }

    /// Fills the counter part of a snapshot. Queue and history sizes are the
    /// caller's business.
    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            total_messages: self.total,
            messages_per_second: self.rate,
            active_topics: self.topic_counts.len(),
            topic_stats: self
                .topic_counts
                .iter()
                .map(|(topic, count)| (topic.clone(), *count))
                .collect(),
            last_message_time: self.last_message_time,
            ..StatisticsSnapshot::default()
        }
    }

    /// Resets every counter. The window length is kept.
    pub fn clear(&mut self) {
        self.total = 0;
        self.topic_counts.clear();
        self.window.clear();
        self.rate = 0.0;
        self.last_message_time = None;
    }
}

impl Default for StatisticsTracker {
    fn default() -> Self {
        Self::new(DEFAULT_RATE_WINDOW_SECS)
    }
}
