//! Token bucket rate limiter for a single provider.
//!
//! Every provider owns its own limiter, so two providers never contend for
//! the same budget. The limiter never rejects; `acquire` only delays.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Default burst: one request, i.e. strict pacing at the configured rate.
const DEFAULT_BURST: f64 = 1.0;

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_update: Instant,
    /// tokens per second
    rate: f64,
    capacity: f64,
}

impl TokenBucket {
    fn new(requests_per_minute: u32, capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_update: Instant::now(),
            rate: requests_per_minute as f64 / 60.0,
            capacity,
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_update = now;
    }

    fn try_acquire(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn time_until_available(&mut self) -> Duration {
        self.refill();
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.rate)
        }
    }
}

/// Per-provider request pacing.
#[derive(Debug)]
pub struct RateLimiter {
    /// `None` means unlimited.
    bucket: Option<Mutex<TokenBucket>>,
    requests_per_minute: Option<u32>,
}

impl RateLimiter {
    /// Build a limiter for `rpm` requests per minute. `None` or `Some(0)` is unlimited.
    pub fn new(rpm: Option<u32>) -> Self {
        Self::with_burst(rpm, DEFAULT_BURST)
    }

    pub fn unlimited() -> Self {
        Self::new(None)
    }

    pub fn with_burst(rpm: Option<u32>, burst: f64) -> Self {
        match rpm.filter(|r| *r > 0) {
            Some(r) => Self {
                bucket: Some(Mutex::new(TokenBucket::new(r, burst.max(1.0)))),
                requests_per_minute: Some(r),
            },
            None => Self {
                bucket: None,
                requests_per_minute: None,
            },
        }
    }

    pub fn requests_per_minute(&self) -> Option<u32> {
        self.requests_per_minute
    }

    /// Suspend until a slot is available, then consume it.
    pub async fn acquire(&self) {
        let Some(bucket) = &self.bucket else {
            return;
        };
        loop {
            let wait = {
                let mut b = bucket.lock();
                if b.try_acquire() {
                    return;
                }
                b.time_until_available()
            };
            if wait > Duration::ZERO {
                debug!(target: "ingest", wait_ms = wait.as_millis() as u64, "rate limiter waiting");
                tokio::time::sleep(wait).await;
            }
        }
    }

    /// Non-blocking variant, mostly for diagnostics.
    pub fn try_acquire(&self) -> bool {
        match &self.bucket {
            Some(b) => b.lock().try_acquire(),
            None => true,
        }
    }
}
