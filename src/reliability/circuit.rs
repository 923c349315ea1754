/// Closed → open → half-open circuit breaker, one per backend.
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::BreakerConfig;
use crate::error::FailureKind;

/// Externally visible breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
enum State {
    Closed,
    Open { until: Instant },
    HalfOpen { probe_in_flight: bool },
}

#[derive(Debug)]
struct Inner {
    state: State,
    /// Timestamps of consecutive failures while closed.
    failures: VecDeque<Instant>,
    cooldown: Duration,
}

pub struct CircuitBreaker {
    backend: String,
    threshold: usize,
    window: Duration,
    base_cooldown: Duration,
    max_cooldown: Duration,
    inner: Mutex<Inner>,
}

/// Permission to make one call. Settle it with [`CircuitPermit::success`] or
/// [`CircuitPermit::failure`]; dropping it unsettled releases a half-open
/// probe slot without counting either way.
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl CircuitPermit<'_> {
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.probe);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.probe);
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.abandon_probe();
        }
    }
}

impl CircuitBreaker {
    pub fn new(backend: &str, config: &BreakerConfig) -> Self {
        let base_cooldown = Duration::from_millis(config.cooldown_ms);
        Self {
            backend: backend.to_string(),
            threshold: config.failure_threshold.max(1) as usize,
            window: Duration::from_secs(config.window_secs),
            base_cooldown,
            max_cooldown: Duration::from_millis(config.max_cooldown_ms).max(base_cooldown),
            inner: Mutex::new(Inner {
                state: State::Closed,
                failures: VecDeque::new(),
                cooldown: base_cooldown,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask to make a call. Fails fast with `CircuitOpen` while open, or while
    /// the single half-open probe is out.
    pub fn try_acquire(&self) -> Result<CircuitPermit<'_>, FailureKind> {
        let mut inner = self.lock();
        let current = inner.state;
        let probe = match current {
            State::Closed => false,
            State::Open { until } if Instant::now() >= until => {
                info!(backend = %self.backend, "Circuit half-open, allowing probe");
                inner.state = State::HalfOpen {
                    probe_in_flight: true,
                };
                true
            }
            State::Open { .. } => return Err(FailureKind::CircuitOpen),
            State::HalfOpen {
                probe_in_flight: true,
            } => return Err(FailureKind::CircuitOpen),
            State::HalfOpen {
                probe_in_flight: false,
            } => {
                inner.state = State::HalfOpen {
                    probe_in_flight: true,
                };
                true
            }
        };
        Ok(CircuitPermit {
            breaker: self,
            probe,
            settled: false,
        })
    }

    /// Only the probe may settle an open or half-open breaker. Permits handed
    /// out while closed are ignored once the state has moved on.
    fn on_success(&self, probe: bool) {
        let mut inner = self.lock();
        let current = inner.state;
        match current {
            State::Closed => inner.failures.clear(),
            State::HalfOpen { .. } if probe => {
                inner.failures.clear();
                inner.state = State::Closed;
                inner.cooldown = self.base_cooldown;
                info!(backend = %self.backend, "Circuit closed");
            }
            State::HalfOpen { .. } | State::Open { .. } => {}
        }
    }

    fn on_failure(&self, probe: bool) {
        let mut inner = self.lock();
        let now = Instant::now();
        let current = inner.state;
        match current {
            State::HalfOpen { .. } if probe => {
                let cooldown = (inner.cooldown * 2).min(self.max_cooldown);
                inner.cooldown = cooldown;
                inner.state = State::Open {
                    until: now + cooldown,
                };
                warn!(
                    backend = %self.backend,
                    cooldown_ms = cooldown.as_millis() as u64,
                    "Probe failed, circuit reopened"
                );
            }
            State::Closed => {
                inner.failures.push_back(now);
                while let Some(&first) = inner.failures.front() {
                    if now.saturating_duration_since(first) > self.window {
                        inner.failures.pop_front();
                    } else {
                        break;
                    }
                }
                if inner.failures.len() >= self.threshold {
                    inner.failures.clear();
                    let cooldown = inner.cooldown;
                    inner.state = State::Open {
                        until: now + cooldown,
                    };
                    info!(
                        backend = %self.backend,
                        threshold = self.threshold,
                        cooldown_ms = cooldown.as_millis() as u64,
                        "Circuit opened"
                    );
                }
            }
            // A call that started before the circuit opened.
            State::HalfOpen { .. } | State::Open { .. } => {}
        }
    }

    fn abandon_probe(&self) {
        let mut inner = self.lock();
        if let State::HalfOpen { .. } = inner.state {
            inner.state = State::HalfOpen {
                probe_in_flight: false,
            };
        }
    }

    pub fn state(&self) -> CircuitState {
        match self.lock().state {
            State::Closed => CircuitState::Closed,
            State::Open { .. } => CircuitState::Open,
            State::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    /// Cooldown the next opening will use.
    pub fn current_cooldown(&self) -> Duration {
        self.lock().cooldown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            "b",
            &BreakerConfig {
                failure_threshold: 3,
                window_secs: 60,
                cooldown_ms: 1_000,
                max_cooldown_ms: 4_000,
            },
        )
    }

    fn fail(b: &CircuitBreaker) {
        b.try_acquire().unwrap().failure();
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_fails_fast() {
        let b = breaker();
        fail(&b);
        fail(&b);
        assert_eq!(b.state(), CircuitState::Closed);
        fail(&b);
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(b.try_acquire().err(), Some(FailureKind::CircuitOpen));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_count() {
        let b = breaker();
        fail(&b);
        fail(&b);
        b.try_acquire().unwrap().success();
        fail(&b);
        fail(&b);
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_do_not_count() {
        let b = breaker();
        fail(&b);
        fail(&b);
        tokio::time::advance(Duration::from_secs(61)).await;
        fail(&b);
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_allows_exactly_one_probe() {
        let b = breaker();
        for _ in 0..3 {
            fail(&b);
        }
        tokio::time::advance(Duration::from_millis(1_000)).await;

        let probe = b.try_acquire().unwrap();
        assert!(probe.is_probe());
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert_eq!(b.try_acquire().err(), Some(FailureKind::CircuitOpen));

        probe.success();
        assert_eq!(b.state(), CircuitState::Closed);
        assert!(b.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_permit_cannot_settle_half_open() {
        let b = breaker();
        let stale_fail = b.try_acquire().unwrap();
        let stale_ok = b.try_acquire().unwrap();
        for _ in 0..3 {
            fail(&b);
        }
        tokio::time::advance(Duration::from_millis(1_000)).await;
        let probe = b.try_acquire().unwrap();
        assert!(probe.is_probe());

        stale_fail.failure();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert_eq!(b.current_cooldown(), Duration::from_millis(1_000));

        stale_ok.success();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert_eq!(b.try_acquire().err(), Some(FailureKind::CircuitOpen));

        probe.success();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_success_does_not_close_open_circuit() {
        let b = breaker();
        let stale = b.try_acquire().unwrap();
        for _ in 0..3 {
            fail(&b);
        }
        stale.success();
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(b.try_acquire().err(), Some(FailureKind::CircuitOpen));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_doubles_cooldown_up_to_cap() {
        let b = breaker();
        for _ in 0..3 {
            fail(&b);
        }

        tokio::time::advance(Duration::from_millis(1_000)).await;
        fail(&b);
        assert_eq!(b.current_cooldown(), Duration::from_millis(2_000));

        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert_eq!(b.try_acquire().err(), Some(FailureKind::CircuitOpen));
        tokio::time::advance(Duration::from_millis(1_000)).await;
        fail(&b);
        assert_eq!(b.current_cooldown(), Duration::from_millis(4_000));

        tokio::time::advance(Duration::from_millis(4_000)).await;
        fail(&b);
        assert_eq!(b.current_cooldown(), Duration::from_millis(4_000));

        tokio::time::advance(Duration::from_millis(4_000)).await;
        b.try_acquire().unwrap().success();
        assert_eq!(b.current_cooldown(), Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_probe_frees_slot() {
        let b = breaker();
        for _ in 0..3 {
            fail(&b);
        }
        tokio::time::advance(Duration::from_millis(1_000)).await;

        drop(b.try_acquire().unwrap());
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert!(b.try_acquire().unwrap().is_probe());
    }
}
