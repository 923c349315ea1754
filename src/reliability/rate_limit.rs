/// Per-backend token buckets (requests and tokens per minute) plus an
/// in-flight cap.
///
/// Callers wait for capacity up to `max_wait`, then fail with
/// `RateLimited`. Every wait is cancellable.
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::config::RateLimitConfig;
use crate::error::FailureKind;

#[derive(Debug)]
struct Bucket {
    capacity: f64,
    available: f64,
    refill_per_sec: f64,
}

impl Bucket {
    fn per_minute(limit: u32) -> Self {
        let capacity = f64::from(limit.max(1));
        Self {
            capacity,
            available: capacity,
            refill_per_sec: capacity / 60.0,
        }
    }

    fn refill(&mut self, elapsed: Duration) {
        self.available =
            (self.available + elapsed.as_secs_f64() * self.refill_per_sec).min(self.capacity);
    }

    /// Time until `amount` is available. Requests larger than the whole
    /// bucket only need a full bucket.
    fn wait_for(&self, amount: f64) -> Duration {
        let amount = amount.min(self.capacity);
        if self.available >= amount {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((amount - self.available) / self.refill_per_sec)
        }
    }

    fn take(&mut self, amount: f64) {
        self.available -= amount.min(self.capacity);
    }
}

#[derive(Debug)]
struct Buckets {
    requests: Bucket,
    tokens: Bucket,
    last_refill: Instant,
}

impl Buckets {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.requests.refill(elapsed);
        self.tokens.refill(elapsed);
        self.last_refill = now;
    }
}

/// Held for the duration of one backend call.
pub struct RatePermit {
    _slot: OwnedSemaphorePermit,
}

pub struct RateLimiter {
    buckets: Mutex<Buckets>,
    slots: Arc<Semaphore>,
    max_wait: Duration,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            buckets: Mutex::new(Buckets {
                requests: Bucket::per_minute(config.requests_per_minute),
                tokens: Bucket::per_minute(config.tokens_per_minute),
                last_refill: Instant::now(),
            }),
            slots: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            max_wait: Duration::from_millis(config.max_wait_ms),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Buckets> {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for a free in-flight slot, then for one request worth `tokens`.
    ///
    /// Bucket capacity is only taken once the slot is held, so a caller that
    /// gives up never spends it.
    pub async fn acquire(
        &self,
        tokens: u32,
        cancel: &CancellationToken,
    ) -> Result<RatePermit, FailureKind> {
        let deadline = Instant::now() + self.max_wait;
        let tokens = f64::from(tokens);

        let slot = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(FailureKind::Cancelled),
            slot = self.slots.clone().acquire_owned() => {
                slot.map_err(|_| FailureKind::BackendUnavailable)?
            }
            () = tokio::time::sleep_until(deadline) => return Err(FailureKind::RateLimited),
        };

        loop {
            let wait = {
                let mut buckets = self.lock();
                let now = Instant::now();
                buckets.refill(now);

                let wait = buckets
                    .requests
                    .wait_for(1.0)
                    .max(buckets.tokens.wait_for(tokens));
                if wait.is_zero() {
                    buckets.requests.take(1.0);
                    buckets.tokens.take(tokens);
                    return Ok(RatePermit { _slot: slot });
                }
                if now + wait > deadline {
                    trace!(wait_ms = wait.as_millis() as u64, "Rate limit wait exceeds ceiling");
                    return Err(FailureKind::RateLimited);
                }
                wait
            };

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(FailureKind::Cancelled),
                () = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Free in-flight slots.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }
}
