use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;
use crate::error::FailureKind;

/// Exponential backoff with jitter, bounded by attempts and total wait.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_total_wait: Duration,
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_total_wait: Duration::from_millis(config.max_total_wait_ms),
            jitter: config.jitter.clamp(0.0, 0.99),
        }
    }

    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0-based), before jitter.
    #[must_use]
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let multiplier = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(multiplier).min(self.max_delay)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        delay.mul_f64(factor)
    }

    /// How long to wait before the next attempt, or `None` to give up.
    ///
    /// `attempts` is the number of attempts already made and `waited` the
    /// backoff time already spent on this call. Only transient failures are
    /// retried.
    pub fn next_delay(&self, kind: FailureKind, attempts: u32, waited: Duration) -> Option<Duration> {
        if !kind.is_transient() || attempts >= self.max_attempts {
            return None;
        }
        let delay = self.jittered(self.backoff_delay(attempts.saturating_sub(1)));
        if waited + delay > self.max_total_wait {
            return None;
        }
        Some(delay)
    }
}
