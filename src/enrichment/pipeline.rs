use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::source::{SourceReader, SpanSource};
use crate::backend::{EnrichmentRequest, PromptTemplate};
use crate::config::EnrichmentConfig;
use crate::error::{RunError, StoreError};
use crate::models::{Entity, RepoHandle};
use crate::reliability::BackendCascade;
use crate::store::{BatchSummary, Db, GraphStore};

/// Tunables for one pipeline, resolved from [`EnrichmentConfig`].
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub batch_size: usize,
    pub max_span_failures: u32,
    pub failure_cooldown: Duration,
    pub parallelism: usize,
    pub max_span_lines: usize,
}

impl PipelineSettings {
    pub fn from_config(config: &EnrichmentConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            max_span_failures: config.max_span_failures.max(1),
            failure_cooldown: Duration::from_secs(config.failure_cooldown_secs),
            parallelism: config.parallelism.max(1),
            max_span_lines: config.max_span_lines,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_config(&EnrichmentConfig::default())
    }
}

pub struct EnrichmentPipeline {
    graphs: Arc<GraphStore>,
    db: Arc<Mutex<Db>>,
    cascade: Arc<BackendCascade>,
    prompt: PromptTemplate,
    settings: PipelineSettings,
}

impl EnrichmentPipeline {
    pub fn new(
        graphs: Arc<GraphStore>,
        db: Arc<Mutex<Db>>,
        cascade: Arc<BackendCascade>,
        prompt: PromptTemplate,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            graphs,
            db,
            cascade,
            prompt,
            settings,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn cascade(&self) -> &BackendCascade {
        &self.cascade
    }

    /// Enrich up to `max_spans` pending spans of `repo`.
    ///
    /// Each span is committed on its own, so an interrupted batch keeps
    /// every record written before the interruption. Span-level failures
    /// are counted and recorded; only store errors and cancellation fail
    /// the run.
    pub async fn run_batch(
        &self,
        repo: &RepoHandle,
        max_spans: usize,
        cancel: &CancellationToken,
    ) -> Result<BatchSummary, RunError> {
        let started_at = Utc::now();
        let mut summary = BatchSummary::default();

        let graph = match self.graphs.load_graph(&repo.id) {
            Ok((graph, _)) => graph,
            Err(e) if e.is_missing_graph() => {
                debug!(repo = %repo.id, error = %e, "No usable graph, nothing to enrich");
                return Ok(summary);
            }
            Err(e) => return Err(e.into()),
        };

        let pending = self.pending_spans(&repo.id, &graph.entities, &mut summary).await?;

        let mut reader = SourceReader::new(&repo.root);
        let mut requests = Vec::new();
        for entity in pending {
            if requests.len() >= max_spans {
                break;
            }
            if entity.span.line_count() > self.settings.max_span_lines {
                debug!(repo = %repo.id, span = %entity.span_hash(), lines = entity.span.line_count(), "Span too long, skipped");
                summary.skipped += 1;
                continue;
            }
            match reader.load(&entity.span).await {
                SpanSource::Verified(code) => requests.push(EnrichmentRequest {
                    span_hash: entity.span_hash(),
                    span: entity.span.clone(),
                    symbol_name: entity.symbol_name.clone(),
                    kind: entity.kind,
                    code,
                }),
                SpanSource::Changed | SpanSource::Unavailable => {
                    debug!(repo = %repo.id, span = %entity.span_hash(), file = %entity.span.file_path, "Span source changed since indexing, skipped");
                    summary.skipped += 1;
                }
            }
        }

        summary.attempted = requests.len();
        let cascade = &self.cascade;
        let prompt = &self.prompt;
        let mut results = std::pin::pin!(
            futures::stream::iter(requests)
                .map(|request| async move {
                    let outcome = cascade.enrich(&request, prompt, cancel).await;
                    (request, outcome)
                })
                .buffer_unordered(self.settings.parallelism)
        );

        let mut cancelled = false;
        while let Some((request, outcome)) = results.next().await {
            for (backend, calls) in outcome.calls_by_backend() {
                *summary.backend_calls.entry(backend).or_insert(0) += calls;
            }
            summary.estimated_cost += outcome.total_cost();

            match outcome.result {
                Ok(record) => {
                    let db = self.db.lock().await;
                    db.upsert_enrichment(&record)?;
                    db.clear_span_failure(&request.span_hash)?;
                    summary.succeeded += 1;
                }
                Err(failure) if failure.is_cancelled() => cancelled = true,
                // No backend saw the span; its history stays untouched.
                Err(failure) if failure.refused_by_all() => {
                    debug!(
                        repo = %repo.id,
                        span = %request.span_hash,
                        kind = %failure.kind(),
                        "Every backend refused the span, skipped"
                    );
                    summary.skipped += 1;
                }
                Err(failure) => {
                    let kind = failure.kind();
                    let count = self.db.lock().await.record_span_failure(
                        &repo.id,
                        &request.span_hash,
                        kind.as_str(),
                        Utc::now(),
                    )?;
                    debug!(
                        repo = %repo.id,
                        span = %request.span_hash,
                        kind = %kind,
                        consecutive = count,
                        "Span enrichment failed"
                    );
                    summary.failed += 1;
                }
            }
        }

        let cancelled = cancelled || cancel.is_cancelled();
        let outcome = if cancelled { "cancelled" } else { "success" };
        self.db
            .lock()
            .await
            .record_run(&repo.id, started_at, Utc::now(), &summary, outcome)?;

        info!(
            repo = %repo.id,
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            calls = summary.total_calls(),
            cost = summary.estimated_cost,
            outcome,
            "Enrichment batch finished"
        );

        if cancelled {
            return Err(RunError::Cancelled);
        }
        Ok(summary)
    }

    /// Spans with no current record and no active failure cool-down,
    /// de-duplicated by span hash, in graph order.
    async fn pending_spans<'g>(
        &self,
        repo_id: &str,
        entities: &'g [Entity],
        summary: &mut BatchSummary,
    ) -> Result<Vec<&'g Entity>, StoreError> {
        let mut seen = HashSet::new();
        let unique: Vec<(&Entity, String)> = entities
            .iter()
            .map(|e| (e, e.span_hash()))
            .filter(|(_, hash)| seen.insert(hash.clone()))
            .collect();

        let hashes: Vec<&str> = unique.iter().map(|(_, h)| h.as_str()).collect();
        let db = self.db.lock().await;
        let existing = db.get_enrichments(&hashes)?;

        let now = Utc::now();
        let cooldown = chrono::Duration::from_std(self.settings.failure_cooldown)
            .unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));

        let mut pending = Vec::new();
        for (entity, hash) in unique {
            if existing.get(&hash).is_some_and(|r| r.is_current()) {
                continue;
            }
            if let Some(failure) = db.span_failure(&hash)? {
                if failure.in_cooldown(self.settings.max_span_failures, cooldown, now) {
                    summary.skipped += 1;
                    continue;
                }
            }
            pending.push(entity);
        }

        if pending.is_empty() {
            debug!(repo = %repo_id, "No pending spans");
        } else if summary.skipped > 0 {
            warn!(repo = %repo_id, cooling_down = summary.skipped, "Spans held back after repeated failures");
        }
        Ok(pending)
    }
}
