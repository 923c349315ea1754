/// Core data model: spans, entities, relations, graph snapshots,
/// enrichment records and repository run state.
use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

/// Version of the enrichment record layout. Records stored with an older
/// version are re-enriched.
pub const ENRICHMENT_SCHEMA_VERSION: u32 = 2;

/// Version of the persisted graph snapshot layout.
pub const GRAPH_VERSION: u32 = 1;

// ── Spans ────────────────────────────────────────────────────────────

/// Stable key for a contiguous code region.
///
/// `content_hash` is the SHA-256 of the region's text as returned by
/// [`span_text`]; any edit to those lines yields a new identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpanIdentity {
    pub file_path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub content_hash: String,
}

impl SpanIdentity {
    /// Compute the identity of `content`, which must be the text of lines
    /// `start_line..=end_line` (1-based) of `file_path`.
    pub fn compute(file_path: &str, start_line: usize, end_line: usize, content: &str) -> Self {
        Self {
            file_path: normalize_path(file_path),
            start_line,
            end_line,
            content_hash: sha256_hex(content.as_bytes()),
        }
    }

    /// Hash over path, line range and content hash. This is the key the
    /// enrichment store is addressed by.
    #[must_use]
    pub fn span_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.file_path.as_bytes());
        hasher.update([0]);
        hasher.update(self.start_line.to_le_bytes());
        hasher.update(self.end_line.to_le_bytes());
        hasher.update([0]);
        hasher.update(self.content_hash.as_bytes());
        to_hex(&hasher.finalize())
    }

    #[must_use]
    pub fn line_count(&self) -> usize {
        self.end_line.saturating_sub(self.start_line) + 1
    }
}

/// Extract lines `start_line..=end_line` (1-based, inclusive) joined with `\n`.
///
/// Returns `None` when the range lies outside the file.
pub fn span_text(file_content: &str, start_line: usize, end_line: usize) -> Option<String> {
    if start_line == 0 || end_line < start_line {
        return None;
    }
    let lines: Vec<&str> = file_content.lines().collect();
    if end_line > lines.len() {
        return None;
    }
    Some(lines[start_line - 1..end_line].join("\n"))
}

/// Forward slashes only, no leading `./`.
pub fn normalize_path(path: &str) -> String {
    let p = path.replace('\\', "/");
    p.strip_prefix("./").map(str::to_string).unwrap_or(p)
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    to_hex(&Sha256::digest(bytes))
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// ── Entities & relations ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Function,
    Method,
    Class,
    Module,
    Variable,
    Constant,
    Type,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Function => "function",
            EntityKind::Method => "method",
            EntityKind::Class => "class",
            EntityKind::Module => "module",
            EntityKind::Variable => "variable",
            EntityKind::Constant => "constant",
            EntityKind::Type => "type",
        }
    }
}

/// A named code construct produced by the upstream extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub symbol_name: String,
    pub kind: EntityKind,
    pub span: SpanIdentity,
    /// Code-derived facts (parameters, return type, ...). The enrichment
    /// merge adds an `"enrichment"` key and never touches the others.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Entity {
    #[must_use]
    pub fn span_hash(&self) -> String {
        self.span.span_hash()
    }

    /// Return a copy with `record` merged under `metadata["enrichment"]`.
    #[must_use]
    pub fn with_enrichment(&self, record: &EnrichmentRecord) -> Entity {
        let mut merged = self.clone();
        if let Ok(value) = serde_json::to_value(record) {
            merged.metadata.insert("enrichment".to_string(), value);
        }
        merged
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    Calls,
    Imports,
    References,
}

impl RelationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationKind::Calls => "calls",
            RelationKind::Imports => "imports",
            RelationKind::References => "references",
        }
    }
}

/// Directed edge `src -> dst` between entity ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Relation {
    pub src: String,
    pub dst: String,
    pub kind: RelationKind,
}

impl Relation {
    pub fn new(src: impl Into<String>, dst: impl Into<String>, kind: RelationKind) -> Self {
        Self {
            src: src.into(),
            dst: dst.into(),
            kind,
        }
    }
}

// ── Graph ────────────────────────────────────────────────────────────

/// One persisted snapshot of a repository's symbol graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Graph {
    pub version: u32,
    pub repo_identity: String,
    pub indexed_at: DateTime<Utc>,
    /// Revision recorded at the last successful index pass.
    #[serde(default)]
    pub source_revision: Option<String>,
    #[serde(default)]
    pub entities: Vec<Entity>,
    #[serde(default)]
    pub relations: Vec<Relation>,
}

/// What [`Graph::validate`] had to drop.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub dangling_dropped: usize,
    pub duplicates_dropped: usize,
    pub duplicate_entities_dropped: usize,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.dangling_dropped == 0
            && self.duplicates_dropped == 0
            && self.duplicate_entities_dropped == 0
    }
}

impl Graph {
    pub fn empty(repo_identity: &str) -> Self {
        Self {
            version: GRAPH_VERSION,
            repo_identity: repo_identity.to_string(),
            indexed_at: Utc::now(),
            source_revision: None,
            entities: Vec::new(),
            relations: Vec::new(),
        }
    }

    /// Drop duplicate entity ids (first wins), edges whose endpoints are not
    /// in this snapshot, and repeated `(src, dst, kind)` triples. Order of
    /// the surviving items is preserved so the result is deterministic.
    pub fn validate(mut self) -> (Graph, LoadReport) {
        let mut report = LoadReport::default();

        let mut ids: HashSet<String> = HashSet::with_capacity(self.entities.len());
        let before = self.entities.len();
        self.entities.retain(|e| ids.insert(e.id.clone()));
        report.duplicate_entities_dropped = before - self.entities.len();

        let mut seen: HashSet<(String, String, RelationKind)> = HashSet::new();
        let mut kept = Vec::with_capacity(self.relations.len());
        for rel in self.relations.drain(..) {
            if !ids.contains(&rel.src) || !ids.contains(&rel.dst) {
                report.dangling_dropped += 1;
                continue;
            }
            if !seen.insert((rel.src.clone(), rel.dst.clone(), rel.kind)) {
                report.duplicates_dropped += 1;
                continue;
            }
            kept.push(rel);
        }
        self.relations = kept;

        if !report.is_clean() {
            warn!(
                repo = %self.repo_identity,
                dangling = report.dangling_dropped,
                duplicate_edges = report.duplicates_dropped,
                duplicate_entities = report.duplicate_entities_dropped,
                "Graph snapshot contained invalid items, dropped"
            );
        }

        (self, report)
    }

    /// Replace every entity in `file_path`, and every relation owned by one
    /// of them, with the given contribution.
    pub fn replace_file(&mut self, file_path: &str, entities: Vec<Entity>, relations: Vec<Relation>) {
        let file_path = normalize_path(file_path);
        let removed: HashSet<String> = self
            .entities
            .iter()
            .filter(|e| e.span.file_path == file_path)
            .map(|e| e.id.clone())
            .collect();

        self.entities.retain(|e| e.span.file_path != file_path);
        self.relations.retain(|r| !removed.contains(&r.src));

        self.entities.extend(entities);
        self.relations.extend(relations);
    }

    pub fn entity(&self, id: &str) -> Option<&Entity> {
        self.entities.iter().find(|e| e.id == id)
    }

    pub fn files(&self) -> Vec<&str> {
        let mut files: Vec<&str> = self
            .entities
            .iter()
            .map(|e| e.span.file_path.as_str())
            .collect();
        files.sort_unstable();
        files.dedup();
        files
    }

    /// Entities with their enrichment merged in. Records whose span hash is
    /// not in this graph are never looked at.
    pub fn merged_entities(&self, records: &HashMap<String, EnrichmentRecord>) -> Vec<Entity> {
        self.entities
            .iter()
            .map(|e| match records.get(&e.span_hash()) {
                Some(record) => e.with_enrichment(record),
                None => e.clone(),
            })
            .collect()
    }
}

// ── Enrichment ───────────────────────────────────────────────────────

/// LLM-generated annotation for one span. Immutable; a re-enrichment
/// produces a new record that supersedes this one by `created_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentRecord {
    pub span_hash: String,
    pub summary: String,
    #[serde(default)]
    pub usage_notes: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub side_effects: Vec<String>,
    #[serde(default)]
    pub pitfalls: Vec<String>,
    pub model_id: String,
    pub created_at: DateTime<Utc>,
    pub schema_version: u32,
}

impl EnrichmentRecord {
    pub fn is_current(&self) -> bool {
        self.schema_version >= ENRICHMENT_SCHEMA_VERSION
    }
}

// ── Repository run state ─────────────────────────────────────────────

/// A registered repository: its id and working tree root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoHandle {
    pub id: String,
    pub root: std::path::PathBuf,
}

impl RepoHandle {
    pub fn new(id: &str, root: impl Into<std::path::PathBuf>) -> Self {
        Self {
            id: id.to_string(),
            root: root.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Running,
    Success,
    Failure,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Idle => "idle",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failure => "failure",
        }
    }
}

/// Per-repository scheduler bookkeeping. Only the scheduler mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryRunState {
    pub repo_id: String,
    pub last_run_at: Option<DateTime<Utc>>,
    pub running: bool,
    pub consecutive_failures: u32,
    pub last_success_commit: Option<String>,
    pub backoff_multiplier: u32,
    pub status: RunStatus,
    pub last_error: Option<String>,
    pub degraded: bool,
    pub last_enriched: usize,
    pub next_due_at: Option<DateTime<Utc>>,
}

impl RepositoryRunState {
    pub fn new(repo_id: &str) -> Self {
        Self {
            repo_id: repo_id.to_string(),
            last_run_at: None,
            running: false,
            consecutive_failures: 0,
            last_success_commit: None,
            backoff_multiplier: 1,
            status: RunStatus::Idle,
            last_error: None,
            degraded: false,
            last_enriched: 0,
            next_due_at: None,
        }
    }
}

// ── Routing ──────────────────────────────────────────────────────────

/// Freshness of the persisted graph relative to the repository head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Freshness {
    Fresh,
    Stale,
    Missing,
}

impl Freshness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Freshness::Fresh => "FRESH",
            Freshness::Stale => "STALE",
            Freshness::Missing => "MISSING",
        }
    }
}

impl fmt::Display for Freshness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which data path served a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Route {
    /// Graph, known to match the repository head.
    Fresh,
    /// Graph, served despite a revision mismatch.
    Stale,
    LocalFallback,
}

impl Route {
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::Fresh => "FRESH",
            Route::Stale => "STALE",
            Route::LocalFallback => "LOCAL_FALLBACK",
        }
    }

    pub fn uses_graph(&self) -> bool {
        !matches!(self, Route::LocalFallback)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(id: &str, name: &str, file: &str, line: usize) -> Entity {
        Entity {
            id: id.to_string(),
            symbol_name: name.to_string(),
            kind: EntityKind::Function,
            span: SpanIdentity::compute(file, line, line, &format!("fn {name}() {{}}")),
            metadata: serde_json::Map::new(),
        }
    }

    #[test]
    fn test_span_hash_changes_with_content() {
        let a = SpanIdentity::compute("src/lib.rs", 1, 3, "fn a() {}");
        let b = SpanIdentity::compute("src/lib.rs", 1, 3, "fn a() { 1 }");
        let a2 = SpanIdentity::compute("./src/lib.rs", 1, 3, "fn a() {}");
        assert_ne!(a.span_hash(), b.span_hash());
        assert_eq!(a.span_hash(), a2.span_hash());
        assert_eq!(a.span_hash().len(), 64);
    }

    #[test]
    fn test_span_text() {
        let content = "one\ntwo\nthree\nfour";
        assert_eq!(span_text(content, 2, 3).as_deref(), Some("two\nthree"));
        assert_eq!(span_text(content, 4, 4).as_deref(), Some("four"));
        assert!(span_text(content, 0, 1).is_none());
        assert!(span_text(content, 3, 9).is_none());
        assert!(span_text(content, 3, 2).is_none());
    }

    #[test]
    fn test_validate_drops_dangling_and_duplicates() {
        let mut graph = Graph::empty("repo");
        graph.entities = vec![
            entity("a", "a", "a.rs", 1),
            entity("b", "b", "b.rs", 1),
            entity("a", "a_dup", "a.rs", 9),
        ];
        graph.relations = vec![
            Relation::new("a", "b", RelationKind::Calls),
            Relation::new("a", "b", RelationKind::Calls),
            Relation::new("a", "b", RelationKind::References),
            Relation::new("a", "ghost", RelationKind::Calls),
        ];

        let (graph, report) = graph.validate();
        assert_eq!(graph.entities.len(), 2);
        assert_eq!(graph.entities[0].symbol_name, "a");
        assert_eq!(graph.relations.len(), 2);
        assert_eq!(report.dangling_dropped, 1);
        assert_eq!(report.duplicates_dropped, 1);
        assert_eq!(report.duplicate_entities_dropped, 1);
        assert!(!report.is_clean());
    }

    #[test]
    fn test_replace_file_swaps_contribution() {
        let mut graph = Graph::empty("repo");
        graph.entities = vec![entity("a", "a", "a.rs", 1), entity("b", "b", "b.rs", 1)];
        graph.relations = vec![
            Relation::new("a", "b", RelationKind::Calls),
            Relation::new("b", "a", RelationKind::Calls),
        ];

        graph.replace_file(
            "a.rs",
            vec![entity("a2", "a2", "a.rs", 5)],
            vec![Relation::new("a2", "b", RelationKind::Imports)],
        );

        let ids: Vec<&str> = graph.entities.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a2"]);
        // b -> a survives until validation because b.rs still owns it.
        assert_eq!(graph.relations.len(), 2);
        let (graph, report) = graph.validate();
        assert_eq!(graph.relations.len(), 1);
        assert_eq!(report.dangling_dropped, 1);
    }

    #[test]
    fn test_merge_is_additive() {
        let mut graph = Graph::empty("repo");
        let mut e = entity("a", "a", "a.rs", 1);
        e.metadata
            .insert("returns".to_string(), serde_json::json!("i32"));
        graph.entities = vec![e.clone()];

        let record = EnrichmentRecord {
            span_hash: e.span_hash(),
            summary: "does a".to_string(),
            usage_notes: String::new(),
            tags: vec!["math".to_string()],
            side_effects: vec![],
            pitfalls: vec![],
            model_id: "m".to_string(),
            created_at: Utc::now(),
            schema_version: ENRICHMENT_SCHEMA_VERSION,
        };
        let orphan = EnrichmentRecord {
            span_hash: "orphan".to_string(),
            ..record.clone()
        };
        let mut records = HashMap::new();
        records.insert(record.span_hash.clone(), record);
        records.insert(orphan.span_hash.clone(), orphan);

        let merged = graph.merged_entities(&records);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].metadata["returns"], "i32");
        assert_eq!(merged[0].metadata["enrichment"]["summary"], "does a");
    }

    #[test]
    fn test_route_labels() {
        assert_eq!(
            serde_json::to_string(&Route::LocalFallback).unwrap(),
            "\"LOCAL_FALLBACK\""
        );
        assert_eq!(serde_json::to_string(&Freshness::Missing).unwrap(), "\"MISSING\"");
        assert!(!Route::LocalFallback.uses_graph());
        assert!(Route::Stale.uses_graph());
    }
}
