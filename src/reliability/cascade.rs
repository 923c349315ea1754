/// Ordered failover across guarded backends.
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::circuit::CircuitState;
use super::cost::CostSnapshot;
use super::guarded::{GuardSettings, GuardedBackend};
use crate::backend::{self, Backend, EnrichmentRequest, PromptTemplate};
use crate::config::Config;
use crate::error::{BackendFailure, FailureKind};
use crate::models::EnrichmentRecord;

/// What one backend did for one span.
#[derive(Debug, Clone)]
pub struct BackendAttempt {
    pub backend: String,
    pub failure: Option<FailureKind>,
    pub calls: u32,
    pub cost: f64,
    pub elapsed: Duration,
}

/// Every backend in the cascade failed for a span.
#[derive(Error, Debug, Clone)]
#[error("all backends failed: {}", summarize(.failures))]
pub struct CascadeFailure {
    pub failures: Vec<BackendFailure>,
}

fn summarize(failures: &[BackendFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}={}", f.backend, f.kind))
        .collect::<Vec<_>>()
        .join(", ")
}

impl CascadeFailure {
    /// The kind recorded in span failure history: the last backend's.
    pub fn kind(&self) -> FailureKind {
        self.failures
            .last()
            .map(|f| f.kind)
            .unwrap_or(FailureKind::BackendUnavailable)
    }

    /// Every backend refused locally (budget or open circuit), so none of
    /// them ever saw the span.
    pub fn refused_by_all(&self) -> bool {
        !self.failures.is_empty() && self.failures.iter().all(|f| f.kind.is_skip())
    }

    pub fn is_cancelled(&self) -> bool {
        self.failures.iter().any(|f| f.kind == FailureKind::Cancelled)
    }
}

#[derive(Debug)]
pub struct CascadeOutcome {
    pub result: Result<EnrichmentRecord, CascadeFailure>,
    pub attempts: Vec<BackendAttempt>,
}

impl CascadeOutcome {
    pub fn total_cost(&self) -> f64 {
        self.attempts.iter().map(|a| a.cost).sum()
    }

    pub fn total_calls(&self) -> u32 {
        self.attempts.iter().map(|a| a.calls).sum()
    }

    /// Calls made, per backend. Backends that were skipped without a call
    /// are left out.
    pub fn calls_by_backend(&self) -> BTreeMap<String, u32> {
        let mut calls = BTreeMap::new();
        for attempt in self.attempts.iter().filter(|a| a.calls > 0) {
            *calls.entry(attempt.backend.clone()).or_insert(0) += attempt.calls;
        }
        calls
    }
}

/// Status of one backend, for operators.
#[derive(Debug, Clone, Serialize)]
pub struct BackendStats {
    pub id: String,
    pub model: String,
    pub circuit: CircuitState,
    pub cost: CostSnapshot,
    pub total_calls: u64,
}

pub struct BackendCascade {
    backends: Vec<GuardedBackend>,
}

impl BackendCascade {
    pub fn new(backends: Vec<GuardedBackend>) -> Self {
        Self { backends }
    }

    /// Build adapters for every configured backend, in order.
    pub fn from_config(config: &Config) -> Result<Self> {
        anyhow::ensure!(!config.backends.is_empty(), "no backends configured");
        let mut backends = Vec::with_capacity(config.backends.len());
        for spec in &config.backends {
            let adapter = backend::build(spec)?;
            backends.push(GuardedBackend::new(
                adapter,
                GuardSettings::from_spec(spec, config),
            ));
        }
        Ok(Self::new(backends))
    }

    /// Cascade over bare adapters that share one set of middleware settings.
    pub fn from_backends(backends: Vec<Arc<dyn Backend>>, settings: GuardSettings) -> Self {
        Self::new(
            backends
                .into_iter()
                .map(|b| GuardedBackend::new(b, settings.clone()))
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Try each backend in order until one produces a record.
    pub async fn enrich(
        &self,
        request: &EnrichmentRequest,
        prompt: &PromptTemplate,
        cancel: &CancellationToken,
    ) -> CascadeOutcome {
        let mut attempts = Vec::with_capacity(self.backends.len());
        let mut failures = Vec::new();

        for (i, guarded) in self.backends.iter().enumerate() {
            let outcome = guarded.call(request, prompt, cancel).await;
            attempts.push(BackendAttempt {
                backend: guarded.id().to_string(),
                failure: outcome.result.as_ref().err().map(|f| f.kind),
                calls: outcome.calls,
                cost: outcome.cost,
                elapsed: outcome.elapsed,
            });

            let failure = match outcome.result {
                Ok(record) => {
                    debug!(backend = %guarded.id(), span = %request.span_hash, "Span enriched");
                    return CascadeOutcome {
                        result: Ok(record),
                        attempts,
                    };
                }
                Err(failure) => failure,
            };

            let cancelled = failure.kind == FailureKind::Cancelled;
            if !cancelled {
                match self.backends.get(i + 1) {
                    Some(next) => warn!(
                        backend = %guarded.id(),
                        next = %next.id(),
                        kind = %failure.kind,
                        span = %request.span_hash,
                        "Backend failed, failing over"
                    ),
                    None => debug!(
                        backend = %guarded.id(),
                        kind = %failure.kind,
                        span = %request.span_hash,
                        "Last backend failed"
                    ),
                }
            }
            failures.push(failure);
            if cancelled {
                break;
            }
        }

        CascadeOutcome {
            result: Err(CascadeFailure { failures }),
            attempts,
        }
    }

    pub fn stats(&self) -> Vec<BackendStats> {
        self.backends
            .iter()
            .map(|b| BackendStats {
                id: b.id().to_string(),
                model: b.model_id().to_string(),
                circuit: b.circuit_state(),
                cost: b.cost_snapshot(),
                total_calls: b.total_calls(),
            })
            .collect()
    }
}
