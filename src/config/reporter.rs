//! Periodic statistics reporting settings.

use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ReporterConfig {
    /// Seconds between two statistics reports.
    #[validate(range(min = 1, message = "Report interval must be at least 1 second"))]
    pub interval: u64,

    /// How many recent messages each report logs at debug level.
    #[validate(range(max = 100, message = "At most 100 recent messages per report"))]
    pub recent_messages: usize,

    /// Number of busiest topics listed per report.
    #[validate(range(max = 50))]
    pub top_topics: usize,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            interval: 10,
            recent_messages: 5,
            top_topics: 5,
        }
    }
}
