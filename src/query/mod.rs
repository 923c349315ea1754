/// Query engine: `search`, `where_used` and `lineage`, routed by graph
/// freshness.
///
/// Every answer carries the route that produced it and the freshness the
/// gateway computed, so a caller can tell a graph-backed answer from a
/// live text scan. "No matches" is an empty `items` list; a query that
/// could not be answered at all is a `QueryError`.
pub mod fallback;
pub mod graph;

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::QueryConfig;
use crate::error::QueryError;
use crate::freshness::{FreshnessGateway, FreshnessReport};
use crate::models::{Entity, Freshness, Graph, RelationKind, RepoHandle, RepositoryRunState, Route};
use crate::store::Db;

pub use fallback::{FallbackSearcher, TextMatch};
pub use graph::{Direction, GraphIndex, MatchKind};

/// Read-only access to scheduler bookkeeping.
pub trait RunStateView: Send + Sync {
    fn run_state(&self, repo_id: &str) -> Option<RepositoryRunState>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum QueryItem {
    /// A graph entity, with enrichment merged into its metadata.
    Entity {
        entity: Entity,
        #[serde(skip_serializing_if = "Option::is_none")]
        matched: Option<MatchKind>,
        #[serde(skip_serializing_if = "Option::is_none")]
        relation: Option<RelationKind>,
        #[serde(skip_serializing_if = "Option::is_none")]
        depth: Option<usize>,
    },
    /// A line found by the live fallback scan.
    Text(TextMatch),
}

impl QueryItem {
    pub fn entity(&self) -> Option<&Entity> {
        match self {
            QueryItem::Entity { entity, .. } => Some(entity),
            QueryItem::Text(_) => None,
        }
    }

    pub fn file_path(&self) -> &str {
        match self {
            QueryItem::Entity { entity, .. } => &entity.span.file_path,
            QueryItem::Text(m) => &m.file_path,
        }
    }

    pub fn line(&self) -> usize {
        match self {
            QueryItem::Entity { entity, .. } => entity.span.start_line,
            QueryItem::Text(m) => m.line,
        }
    }
}

/// Result envelope shared by every query operation.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub items: Vec<QueryItem>,
    pub route: Route,
    pub freshness: Freshness,
    pub graph_revision: Option<String>,
    pub head_revision: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_state: Option<RepositoryRunState>,
}

#[derive(Debug, Clone)]
enum Operation {
    Search(String),
    WhereUsed(String),
    Lineage(String, Direction),
}

impl Operation {
    fn name(&self) -> &'static str {
        match self {
            Operation::Search(_) => "search",
            Operation::WhereUsed(_) => "where_used",
            Operation::Lineage(..) => "lineage",
        }
    }
}

pub struct QueryEngine {
    gateway: FreshnessGateway,
    db: Arc<tokio::sync::Mutex<Db>>,
    fallback: Arc<FallbackSearcher>,
    config: QueryConfig,
    run_states: Option<Arc<dyn RunStateView>>,
}

impl QueryEngine {
    pub fn new(
        gateway: FreshnessGateway,
        db: Arc<tokio::sync::Mutex<Db>>,
        fallback: FallbackSearcher,
        config: QueryConfig,
    ) -> Self {
        Self {
            gateway,
            db,
            fallback: Arc::new(fallback),
            config,
            run_states: None,
        }
    }

    /// Attach the scheduler so results report the repository's run state.
    pub fn with_run_states(mut self, view: Arc<dyn RunStateView>) -> Self {
        self.run_states = Some(view);
        self
    }

    /// Symbol search. `limit == 0` means the configured default.
    pub async fn search(&self, repo: &RepoHandle, query: &str, limit: usize) -> Result<QueryResult, QueryError> {
        let query = non_empty("query", query)?;
        let limit = self.limit_or_default(limit);
        self.execute(repo, Operation::Search(query.to_string()), limit)
            .await
    }

    /// Direct callers and referrers of `symbol`.
    pub async fn where_used(&self, repo: &RepoHandle, symbol: &str, limit: usize) -> Result<QueryResult, QueryError> {
        let symbol = non_empty("symbol", symbol)?;
        let limit = self.limit_or_default(limit);
        self.execute(repo, Operation::WhereUsed(symbol.to_string()), limit)
            .await
    }

    /// Transitive walk from `symbol`, capped at `max_results` and at the
    /// configured ceiling.
    pub async fn lineage(
        &self,
        repo: &RepoHandle,
        symbol: &str,
        direction: Direction,
        max_results: usize,
    ) -> Result<QueryResult, QueryError> {
        let symbol = non_empty("symbol", symbol)?;
        let max_results = if max_results == 0 {
            self.config.max_lineage_results
        } else {
            max_results.min(self.config.max_lineage_results)
        };
        self.execute(repo, Operation::Lineage(symbol.to_string(), direction), max_results)
            .await
    }

    fn limit_or_default(&self, limit: usize) -> usize {
        if limit == 0 {
            self.config.default_limit
        } else {
            limit
        }
    }

    async fn execute(&self, repo: &RepoHandle, op: Operation, limit: usize) -> Result<QueryResult, QueryError> {
        let decision = self.gateway.evaluate(repo).await;
        let report = decision.report;

        let items = match decision.graph {
            Some(graph) => self.from_graph(graph, &op, limit).await,
            None => self.from_fallback(repo, op.clone(), limit, &report).await?,
        };

        info!(
            repo = %repo.id,
            op = op.name(),
            route = %report.route,
            freshness = %report.freshness,
            items = items.len(),
            "Query answered"
        );

        Ok(QueryResult {
            items,
            route: report.route,
            freshness: report.freshness,
            graph_revision: report.graph_revision,
            head_revision: report.head_revision,
            run_state: self.run_states.as_ref().and_then(|v| v.run_state(&repo.id)),
        })
    }

    async fn from_graph(&self, graph: Graph, op: &Operation, limit: usize) -> Vec<QueryItem> {
        let hashes: Vec<String> = graph.entities.iter().map(Entity::span_hash).collect();
        // Unreadable annotations degrade to the bare graph.
        let records = match self.db.lock().await.get_enrichments(&hashes) {
            Ok(records) => records,
            Err(e) => {
                warn!(repo = %graph.repo_identity, error = %e, "Enrichment lookup failed, serving bare graph");
                Default::default()
            }
        };
        let index = GraphIndex::new(graph.merged_entities(&records), &graph.relations);

        match op {
            Operation::Search(query) => index
                .search(query, limit)
                .into_iter()
                .map(|hit| QueryItem::Entity {
                    entity: hit.entity.clone(),
                    matched: Some(hit.matched),
                    relation: None,
                    depth: None,
                })
                .collect(),
            Operation::WhereUsed(symbol) => index
                .where_used(symbol, limit)
                .into_iter()
                .map(|hit| QueryItem::Entity {
                    entity: hit.entity.clone(),
                    matched: None,
                    relation: Some(hit.relation),
                    depth: None,
                })
                .collect(),
            Operation::Lineage(symbol, direction) => index
                .lineage(symbol, *direction, limit)
                .into_iter()
                .map(|hit| QueryItem::Entity {
                    entity: hit.entity.clone(),
                    matched: None,
                    relation: Some(hit.relation),
                    depth: Some(hit.depth),
                })
                .collect(),
        }
    }

    async fn from_fallback(
        &self,
        repo: &RepoHandle,
        op: Operation,
        limit: usize,
        report: &FreshnessReport,
    ) -> Result<Vec<QueryItem>, QueryError> {
        debug!(repo = %repo.id, op = op.name(), "Serving query from live scan");

        let searcher = Arc::clone(&self.fallback);
        let root = repo.root.clone();
        let scanned = tokio::task::spawn_blocking(move || match op {
            Operation::Search(query) => searcher.search(&root, &query, limit),
            Operation::WhereUsed(symbol) => searcher.where_used(&root, &symbol, limit),
            Operation::Lineage(symbol, direction) => searcher.lineage(&root, &symbol, direction, limit),
        })
        .await;

        let unavailable = |fallback: String| QueryError::Unavailable {
            graph: report
                .reason
                .clone()
                .unwrap_or_else(|| format!("graph {}", report.freshness)),
            fallback,
        };

        match scanned {
            Ok(Ok(matches)) => Ok(matches.into_iter().map(QueryItem::Text).collect()),
            Ok(Err(e)) => Err(unavailable(e.to_string())),
            Err(e) => Err(unavailable(format!("scan task failed: {e}"))),
        }
    }
}

fn non_empty<'q>(name: &str, value: &'q str) -> Result<&'q str, QueryError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(QueryError::InvalidArgument(format!("{name} must not be empty")));
    }
    Ok(trimmed)
}
