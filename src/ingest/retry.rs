// src/ingest/retry.rs
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Upper bound for a single backoff sleep.
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Per-provider retry policy: `max_retries` extra attempts after the first,
/// sleeping `backoff_base_ms * 2^attempt` between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_base_ms: 500,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff_base_ms: 0,
        }
    }

    /// Delay before the attempt following `attempt` (zero-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self.backoff_base_ms.saturating_mul(factor);
        Duration::from_millis(ms).min(MAX_BACKOFF)
    }

    pub fn should_retry(&self, attempt: u32, transient: bool) -> bool {
        transient && attempt < self.max_retries
    }
}
