use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::pipeline::EnrichmentPipeline;
use crate::error::RunError;
use crate::models::RepoHandle;
use crate::scheduler::{RepoJob, RunReport};
use crate::vcs::VcsAdapter;

/// Scheduler job: one enrichment batch per run.
pub struct EnrichmentJob {
    pipeline: Arc<EnrichmentPipeline>,
    vcs: Arc<dyn VcsAdapter>,
}

impl EnrichmentJob {
    pub fn new(pipeline: Arc<EnrichmentPipeline>, vcs: Arc<dyn VcsAdapter>) -> Self {
        Self { pipeline, vcs }
    }
}

#[async_trait]
impl RepoJob for EnrichmentJob {
    async fn run(&self, repo: &RepoHandle, cancel: CancellationToken) -> Result<RunReport, RunError> {
        let batch_size = self.pipeline.settings().batch_size;
        let summary = self.pipeline.run_batch(repo, batch_size, &cancel).await?;

        // Revision lookup failures only cost us the commit stamp.
        let revision = match self.vcs.head_revision(&repo.root).await {
            Ok(rev) => Some(rev),
            Err(e) => {
                debug!(repo = %repo.id, error = %e, "Head revision unavailable after run");
                None
            }
        };

        Ok(RunReport {
            enriched: summary.succeeded,
            revision,
        })
    }
}
