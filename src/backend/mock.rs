/// Scripted backend for tests.
///
/// Produces deterministic records without any network access and counts
/// every call that actually reaches it.
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use super::{Backend, EnrichmentRequest, PromptTemplate};
use crate::error::{BackendFailure, FailureKind};
use crate::models::{ENRICHMENT_SCHEMA_VERSION, EnrichmentRecord};

/// What the next call returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeed,
    Fail(FailureKind),
}

pub struct ScriptedBackend {
    id: String,
    script: Mutex<VecDeque<Outcome>>,
    /// Used once the script runs out.
    fallback: Outcome,
    cost_per_call: f64,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedBackend {
    /// Play `script` in order, then keep returning `fallback`.
    #[must_use]
    pub fn scripted(id: &str, script: Vec<Outcome>, fallback: Outcome) -> Self {
        Self {
            id: id.to_string(),
            script: Mutex::new(script.into()),
            fallback,
            cost_per_call: 0.0,
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn always_ok(id: &str) -> Self {
        Self::scripted(id, Vec::new(), Outcome::Succeed)
    }

    #[must_use]
    pub fn always_failing(id: &str, kind: FailureKind) -> Self {
        Self::scripted(id, Vec::new(), Outcome::Fail(kind))
    }

    /// Estimated (and charged) cost of every call.
    #[must_use]
    pub fn with_cost(mut self, cost_per_call: f64) -> Self {
        self.cost_per_call = cost_per_call;
        self
    }

    /// Sleep before answering, to exercise timeouts and cancellation.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Calls that reached this backend.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_outcome(&self) -> Outcome {
        self.script
            .lock()
            .ok()
            .and_then(|mut s| s.pop_front())
            .unwrap_or(self.fallback)
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn model_id(&self) -> &str {
        "scripted"
    }

    async fn enrich(
        &self,
        request: &EnrichmentRequest,
        _prompt: &PromptTemplate,
    ) -> Result<EnrichmentRecord, BackendFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match self.next_outcome() {
            Outcome::Succeed => Ok(EnrichmentRecord {
                span_hash: request.span_hash.clone(),
                summary: format!("{} {} summary", request.kind.as_str(), request.symbol_name),
                usage_notes: String::new(),
                tags: vec![request.kind.as_str().to_string()],
                side_effects: Vec::new(),
                pitfalls: Vec::new(),
                model_id: format!("{}/scripted", self.id),
                created_at: Utc::now(),
                schema_version: ENRICHMENT_SCHEMA_VERSION,
            }),
            Outcome::Fail(kind) => Err(BackendFailure::new(&self.id, kind, "scripted failure")),
        }
    }

    fn cost_estimate(&self, _request: &EnrichmentRequest) -> f64 {
        self.cost_per_call
    }
}
