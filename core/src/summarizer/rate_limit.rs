//! Token-bucket rate limiter for summarizer calls.
//!
//! Continuous refill at `rate` tokens per second up to `capacity`.
//! `acquire` polls on a 10 ms tick and releases the bucket lock between
//! ticks while sleeping, so a slow waiter never starves other callers.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::GatewayErr;
use crate::error::Result;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct RateLimiter {
    bucket: Mutex<Bucket>,
    rate: f64,
    capacity: f64,
}

impl RateLimiter {
    /// A limiter allowing `rate` acquisitions per second with burst
    /// `capacity`. The bucket starts full.
    pub fn new(rate: f64, capacity: f64) -> Self {
        Self {
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            rate,
            capacity,
        }
    }

    /// Take one token, waiting until one is available or the token is
    /// cancelled.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            if self.try_acquire() {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(GatewayErr::Cancelled),
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }

    fn try_acquire(&self) -> bool {
        let mut bucket = self.bucket.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.capacity);
        bucket.last_refill = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
