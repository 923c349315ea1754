/// One backend wrapped in its full middleware stack: budget check, circuit
/// breaker, rate limiter, per-call timeout and retry.
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::circuit::{CircuitBreaker, CircuitState};
use super::cost::{CostSnapshot, CostTracker};
use super::rate_limit::RateLimiter;
use super::retry::RetryPolicy;
use crate::backend::{Backend, EnrichmentRequest, PromptTemplate};
use crate::config::{BackendSpec, BreakerConfig, BudgetConfig, Config, RateLimitConfig};
use crate::error::{BackendFailure, FailureKind};
use crate::models::EnrichmentRecord;

/// Middleware settings for one backend.
#[derive(Debug, Clone)]
pub struct GuardSettings {
    pub limits: RateLimitConfig,
    pub budget: BudgetConfig,
    pub retry: RetryPolicy,
    pub breaker: BreakerConfig,
    pub timeout: Duration,
}

impl GuardSettings {
    pub fn from_spec(spec: &BackendSpec, config: &Config) -> Self {
        Self {
            limits: spec.limits().clone(),
            budget: spec.budget().clone(),
            retry: RetryPolicy::from_config(&config.retry),
            breaker: config.breaker.clone(),
            timeout: spec.timeout(),
        }
    }
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            limits: RateLimitConfig::default(),
            budget: BudgetConfig::default(),
            retry: RetryPolicy::default(),
            breaker: BreakerConfig::default(),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Result of one guarded call, with what it actually cost.
#[derive(Debug)]
pub struct GuardedOutcome {
    pub result: Result<EnrichmentRecord, BackendFailure>,
    /// Requests that reached the backend.
    pub calls: u32,
    pub cost: f64,
    pub elapsed: Duration,
}

pub struct GuardedBackend {
    backend: Arc<dyn Backend>,
    limiter: RateLimiter,
    breaker: CircuitBreaker,
    cost: CostTracker,
    retry: RetryPolicy,
    timeout: Duration,
    total_calls: AtomicU64,
}

impl GuardedBackend {
    pub fn new(backend: Arc<dyn Backend>, settings: GuardSettings) -> Self {
        let id = backend.id().to_string();
        Self {
            limiter: RateLimiter::new(&settings.limits),
            breaker: CircuitBreaker::new(&id, &settings.breaker),
            cost: CostTracker::new(&id, &settings.budget),
            retry: settings.retry,
            timeout: settings.timeout,
            backend,
            total_calls: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        self.backend.id()
    }

    pub fn model_id(&self) -> &str {
        self.backend.model_id()
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn cost_snapshot(&self) -> CostSnapshot {
        self.cost.snapshot()
    }

    /// Calls that reached the backend since startup.
    pub fn total_calls(&self) -> u64 {
        self.total_calls.load(Ordering::Relaxed)
    }

    /// Call the backend, retrying transient failures. Budget and circuit
    /// refusals return at once.
    pub async fn call(
        &self,
        request: &EnrichmentRequest,
        prompt: &PromptTemplate,
        cancel: &CancellationToken,
    ) -> GuardedOutcome {
        let started = Instant::now();
        let mut calls = 0u32;
        let mut cost = 0.0f64;
        let mut attempts = 0u32;
        let mut waited = Duration::ZERO;

        let result = loop {
            attempts += 1;
            let failure = match self
                .attempt(request, prompt, cancel, &mut calls, &mut cost)
                .await
            {
                Ok(record) => break Ok(record),
                Err(failure) => failure,
            };

            if failure.kind.is_skip() || failure.kind == FailureKind::Cancelled {
                break Err(failure);
            }
            let Some(delay) = self.retry.next_delay(failure.kind, attempts, waited) else {
                break Err(failure);
            };

            debug!(
                backend = %self.id(),
                span = %request.span_hash,
                kind = %failure.kind,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                "Retrying backend call"
            );
            tokio::select! {
                () = cancel.cancelled() => {
                    break Err(BackendFailure::new(self.id(), FailureKind::Cancelled, "cancelled during backoff"));
                }
                () = tokio::time::sleep(delay) => {}
            }
            waited += delay;
        };

        GuardedOutcome {
            result,
            calls,
            cost,
            elapsed: started.elapsed(),
        }
    }

    async fn attempt(
        &self,
        request: &EnrichmentRequest,
        prompt: &PromptTemplate,
        cancel: &CancellationToken,
        calls: &mut u32,
        cost: &mut f64,
    ) -> Result<EnrichmentRecord, BackendFailure> {
        let id = self.id();
        if cancel.is_cancelled() {
            return Err(BackendFailure::new(id, FailureKind::Cancelled, "cancelled"));
        }
        let estimate = self.backend.cost_estimate(request);

        self.cost
            .check(estimate)
            .map_err(|kind| BackendFailure::new(id, kind, "budget exhausted for this period"))?;
        let permit = self
            .breaker
            .try_acquire()
            .map_err(|kind| BackendFailure::new(id, kind, "circuit open"))?;
        // An unsettled permit is dropped here, so a local refusal never
        // counts against the backend.
        let _slot = self
            .limiter
            .acquire(request.estimated_tokens(), cancel)
            .await
            .map_err(|kind| BackendFailure::new(id, kind, "local rate limit"))?;

        *calls += 1;
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(BackendFailure::new(id, FailureKind::Cancelled, "cancelled in flight")),
            r = tokio::time::timeout(self.timeout, self.backend.enrich(request, prompt)) => match r {
                Ok(r) => r,
                Err(_) => Err(BackendFailure::new(
                    id,
                    FailureKind::Timeout,
                    format!("no response within {:?}", self.timeout),
                )),
            },
        };

        self.cost.record(estimate);
        *cost += estimate;

        match &result {
            Ok(_) => permit.success(),
            Err(f) if f.kind == FailureKind::Cancelled => drop(permit),
            Err(f) if f.kind.trips_breaker() => permit.failure(),
            // The backend answered, just not usefully.
            Err(_) => permit.success(),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{Outcome, ScriptedBackend};
    use crate::models::{EntityKind, SpanIdentity};

    fn request() -> EnrichmentRequest {
        let span = SpanIdentity::compute("a.rs", 1, 1, "fn a() {}");
        EnrichmentRequest {
            span_hash: span.span_hash(),
            span,
            symbol_name: "a".into(),
            kind: EntityKind::Function,
            code: "fn a() {}".into(),
        }
    }

    fn settings() -> GuardSettings {
        GuardSettings {
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(1),
                max_total_wait: Duration::from_secs(10),
                jitter: 0.0,
            },
            ..GuardSettings::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_retried() {
        let backend = Arc::new(ScriptedBackend::scripted(
            "s",
            vec![
                Outcome::Fail(FailureKind::Timeout),
                Outcome::Fail(FailureKind::BackendUnavailable),
            ],
            Outcome::Succeed,
        ));
        let guarded = GuardedBackend::new(backend.clone(), settings());

        let outcome = guarded
            .call(&request(), &PromptTemplate::default(), &CancellationToken::new())
            .await;
        assert!(outcome.result.is_ok());
        assert_eq!(outcome.calls, 3);
        assert_eq!(backend.calls(), 3);
        // 100ms + 200ms of backoff
        assert!(outcome.elapsed >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_not_retried() {
        let backend = Arc::new(ScriptedBackend::always_failing("s", FailureKind::AuthFailed));
        let guarded = GuardedBackend::new(backend.clone(), settings());

        let outcome = guarded
            .call(&request(), &PromptTemplate::default(), &CancellationToken::new())
            .await;
        assert_eq!(outcome.result.unwrap_err().kind, FailureKind::AuthFailed);
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_bounded_by_attempts() {
        let backend = Arc::new(ScriptedBackend::always_failing("s", FailureKind::Timeout));
        let guarded = GuardedBackend::new(backend.clone(), settings());

        let outcome = guarded
            .call(&request(), &PromptTemplate::default(), &CancellationToken::new())
            .await;
        assert_eq!(outcome.result.unwrap_err().kind, FailureKind::Timeout);
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_backend_times_out() {
        let backend = Arc::new(ScriptedBackend::always_ok("s").with_delay(Duration::from_secs(5)));
        let guarded = GuardedBackend::new(
            backend,
            GuardSettings {
                timeout: Duration::from_secs(1),
                retry: RetryPolicy::none(),
                ..settings()
            },
        );

        let outcome = guarded
            .call(&request(), &PromptTemplate::default(), &CancellationToken::new())
            .await;
        assert_eq!(outcome.result.unwrap_err().kind, FailureKind::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_refusal_skips_network() {
        let backend = Arc::new(ScriptedBackend::always_ok("s").with_cost(1.0));
        let guarded = GuardedBackend::new(
            backend.clone(),
            GuardSettings {
                budget: BudgetConfig {
                    daily_usd: Some(2.0),
                    ..BudgetConfig::default()
                },
                ..settings()
            },
        );
        let cancel = CancellationToken::new();
        let prompt = PromptTemplate::default();

        assert!(guarded.call(&request(), &prompt, &cancel).await.result.is_ok());
        assert!(guarded.call(&request(), &prompt, &cancel).await.result.is_ok());
        let third = guarded.call(&request(), &prompt, &cancel).await;
        assert_eq!(third.result.unwrap_err().kind, FailureKind::BudgetExceeded);
        assert_eq!(third.calls, 0);
        assert_eq!(backend.calls(), 2);
        assert_eq!(guarded.cost_snapshot().daily_spent, 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_call() {
        let backend = Arc::new(ScriptedBackend::always_ok("s").with_delay(Duration::from_secs(30)));
        let guarded = GuardedBackend::new(backend, settings());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let outcome = guarded
            .call(&request(), &PromptTemplate::default(), &cancel)
            .await;
        assert_eq!(outcome.result.unwrap_err().kind, FailureKind::Cancelled);
        assert_eq!(guarded.circuit_state(), CircuitState::Closed);
    }
}
