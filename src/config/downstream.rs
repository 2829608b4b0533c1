//! Settings for the consumer side: the reading handler and the queue poller.

use serde::{Deserialize, Serialize};
use validator::Validate;

/// `[handler]` section.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct HandlerConfig {
    /// Readings strictly above this temperature raise an alert.
    pub alert_threshold: i32,

    #[validate(length(min = 1, message = "Alert topic must not be empty"))]
    pub alert_topic: String,

    #[validate(length(min = 1, message = "Table name must not be empty"))]
    pub table: String,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            alert_threshold: 27,
            alert_topic: "temperature-alerts".to_string(),
            table: "TemperatureData".to_string(),
        }
    }
}

/// `[consumer]` section.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ConsumerConfig {
    #[validate(range(min = 100, message = "Poll interval must be at least 100 ms"))]
    pub poll_interval_ms: u64,

    #[validate(range(min = 1, max = 10, message = "Max messages must be between 1 and 10"))]
    pub max_messages: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5000,
            max_messages: 1,
        }
    }
}
