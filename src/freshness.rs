/// Freshness gateway: decides whether a query may trust the persisted graph.
///
/// The decision is a pure function of the graph's recorded revision, the
/// current head revision and whether the graph could be read at all. No
/// state is kept between calls.
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::StalePolicy;
use crate::error::StoreError;
use crate::models::{Freshness, Graph, RepoHandle, Route};
use crate::store::GraphStore;
use crate::vcs::VcsAdapter;

/// What the graph store had for a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphProbe {
    Present { source_revision: Option<String> },
    Absent,
    Corrupt(String),
}

/// Classify a graph against the head revision. A missing head (VCS
/// failure) is treated like a missing graph.
pub fn classify(probe: &GraphProbe, head: Option<&str>) -> Freshness {
    let GraphProbe::Present { source_revision } = probe else {
        return Freshness::Missing;
    };
    let Some(head) = head else {
        return Freshness::Missing;
    };
    match source_revision {
        Some(rev) if same_revision(rev, head) => Freshness::Fresh,
        _ => Freshness::Stale,
    }
}

fn same_revision(a: &str, b: &str) -> bool {
    let (a, b) = (a.trim(), b.trim());
    !a.is_empty() && a.eq_ignore_ascii_case(b)
}

pub fn route_for(freshness: Freshness, policy: StalePolicy) -> Route {
    match (freshness, policy) {
        (Freshness::Fresh, _) => Route::Fresh,
        (Freshness::Stale, StalePolicy::ServeStale) => Route::Stale,
        (Freshness::Stale, StalePolicy::ForceFallback) => Route::LocalFallback,
        (Freshness::Missing, _) => Route::LocalFallback,
    }
}

/// Computed state, always surfaced to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FreshnessReport {
    pub freshness: Freshness,
    pub route: Route,
    pub graph_revision: Option<String>,
    pub head_revision: Option<String>,
    /// Why the graph was not usable, when it was not.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub struct GatewayDecision {
    pub report: FreshnessReport,
    /// The loaded graph, present whenever `report.route` uses it.
    pub graph: Option<Graph>,
}

pub struct FreshnessGateway {
    graphs: Arc<GraphStore>,
    vcs: Arc<dyn VcsAdapter>,
    policy: StalePolicy,
}

impl FreshnessGateway {
    pub fn new(graphs: Arc<GraphStore>, vcs: Arc<dyn VcsAdapter>, policy: StalePolicy) -> Self {
        Self {
            graphs,
            vcs,
            policy,
        }
    }

    pub fn policy(&self) -> StalePolicy {
        self.policy
    }

    /// Evaluate a repository. Never fails: unreadable graphs and VCS errors
    /// become `Missing`.
    pub async fn evaluate(&self, repo: &RepoHandle) -> GatewayDecision {
        let (probe, graph) = self.probe_graph(&repo.id).await;

        let mut reason = match &probe {
            GraphProbe::Absent => Some("graph not found".to_string()),
            GraphProbe::Corrupt(e) => Some(format!("graph unreadable: {e}")),
            GraphProbe::Present { .. } => None,
        };

        let head = match self.vcs.head_revision(&repo.root).await {
            Ok(rev) => Some(rev),
            Err(e) => {
                warn!(repo = %repo.id, error = %e, "Head revision lookup failed");
                reason.get_or_insert_with(|| format!("head revision unavailable: {e}"));
                None
            }
        };

        let freshness = classify(&probe, head.as_deref());
        let route = route_for(freshness, self.policy);
        debug!(repo = %repo.id, freshness = %freshness, route = %route, "Freshness evaluated");

        let graph_revision = match &probe {
            GraphProbe::Present { source_revision } => source_revision.clone(),
            _ => None,
        };

        GatewayDecision {
            report: FreshnessReport {
                freshness,
                route,
                graph_revision,
                head_revision: head,
                reason,
            },
            graph: if route.uses_graph() { graph } else { None },
        }
    }

    async fn probe_graph(&self, repo_id: &str) -> (GraphProbe, Option<Graph>) {
        let graphs = Arc::clone(&self.graphs);
        let id = repo_id.to_string();
        let loaded = tokio::task::spawn_blocking(move || graphs.load_graph(&id)).await;

        match loaded {
            Ok(Ok((graph, _report))) => (
                GraphProbe::Present {
                    source_revision: graph.source_revision.clone(),
                },
                Some(graph),
            ),
            Ok(Err(StoreError::NotFound(_))) => (GraphProbe::Absent, None),
            Ok(Err(e)) => (GraphProbe::Corrupt(e.to_string()), None),
            Err(e) => (GraphProbe::Corrupt(format!("graph load task failed: {e}")), None),
        }
    }
}
