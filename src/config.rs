use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a [`WorkQueue`](crate::WorkQueue).
///
/// Every field has a default, so a partial configuration file deserializes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Number of works executed concurrently.
    pub num_workers: usize,
    /// How long an idle worker sleeps before looking for work again, in milliseconds.
    pub poll_interval_ms: u64,
    /// Upper bound of the random jitter added to the poll interval, in milliseconds.
    pub jitter_ms: u64,
    /// In-process retries of a failed work before it is surfaced as failed.
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds. Doubles on every attempt.
    pub retry_delay_ms: u64,
    /// Stop the workers once nothing is queued or running.
    pub shutdown_when_queue_empty: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            num_workers: 1,
            poll_interval_ms: 1000,
            jitter_ms: 100,
            max_retries: 0,
            retry_delay_ms: 1000,
            shutdown_when_queue_empty: false,
        }
    }
}

impl QueueConfig {
    /// Poll interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Jitter bound as a [`Duration`].
    pub fn jitter(&self) -> Duration {
        Duration::from_millis(self.jitter_ms)
    }

    /// Backoff before retry number `attempt + 1`.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(16)).unwrap_or(u64::MAX);
        Duration::from_millis(self.retry_delay_ms.saturating_mul(factor))
    }
}
