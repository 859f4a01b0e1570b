use serde::{Deserialize, Serialize};

use crate::types::HumanDuration;

/// `[runtime]` section: worker pool and scheduling knobs.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Number of aggregation workers. Documents are partitioned across
    /// workers by group key.
    pub workers: usize,
    /// Capacity of the source channel and of each worker channel.
    pub channel_capacity: usize,
    /// How often the ingest task broadcasts the watermark to workers.
    pub watermark_interval: HumanDuration,
    /// Emit still-open windows when the processor stops.
    pub flush_on_stop: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            channel_capacity: 1024,
            watermark_interval: std::time::Duration::from_secs(1).into(),
            flush_on_stop: true,
        }
    }
}

/// `[retry]` section: backoff for sink writes and source reconnects.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff: HumanDuration,
    pub max_backoff: HumanDuration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: std::time::Duration::from_millis(100).into(),
            max_backoff: std::time::Duration::from_secs(5).into(),
        }
    }
}
