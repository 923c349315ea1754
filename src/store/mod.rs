//! Persistence: JSON graph snapshots plus a SQLite enrichment store.
//!
//! The two are joined by span hash at read time only.
use rusqlite::Connection;
use std::path::Path;
use tracing::info;

use crate::error::StoreError;

pub mod enrichment;
pub mod failures;
pub mod graph;
pub mod runs;

pub use failures::SpanFailure;
pub use graph::GraphStore;
pub use runs::{BatchSummary, RunRecord};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS enrichments (
    span_hash TEXT PRIMARY KEY,
    summary TEXT NOT NULL,
    usage_notes TEXT NOT NULL DEFAULT '',
    tags TEXT NOT NULL DEFAULT '[]',
    side_effects TEXT NOT NULL DEFAULT '[]',
    pitfalls TEXT NOT NULL DEFAULT '[]',
    model_id TEXT NOT NULL,
    created_at DATETIME NOT NULL,
    schema_version INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_enrich_schema ON enrichments(schema_version);

CREATE TABLE IF NOT EXISTS span_failures (
    span_hash TEXT PRIMARY KEY,
    repo_id TEXT NOT NULL,
    consecutive_failures INTEGER NOT NULL,
    last_error TEXT NOT NULL,
    last_failed_at DATETIME NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_failure_repo ON span_failures(repo_id);

CREATE TABLE IF NOT EXISTS enrichment_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    repo_id TEXT NOT NULL,
    started_at DATETIME NOT NULL,
    finished_at DATETIME NOT NULL,
    attempted INTEGER NOT NULL,
    succeeded INTEGER NOT NULL,
    failed INTEGER NOT NULL,
    skipped INTEGER NOT NULL,
    backend_calls TEXT NOT NULL DEFAULT '{}',
    estimated_cost REAL NOT NULL DEFAULT 0.0,
    outcome TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_runs_repo ON enrichment_runs(repo_id, id);
"#;

/// A wrapper around a SQLite connection initialized with the enrichment schema.
pub struct Db {
    pub(crate) conn: Connection,
}

impl Db {
    /// Open a database connection at the given path and initialize the schema.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        info!("Initializing enrichment store: {}", path.display());

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;

        // Readers only ever see committed records
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")?;
        conn.execute_batch(SCHEMA_SQL)?;

        info!("Enrichment store initialized successfully");

        Ok(Self { conn })
    }

    /// Open an in-memory database connection (useful for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn })
    }
}

/// Serialize a string list for a TEXT column.
pub(crate) fn encode_list(values: &[String]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".to_string())
}

/// Inverse of [`encode_list`]; tolerates garbage by returning an empty list.
pub(crate) fn decode_list(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_init() {
        let db = Db::open_in_memory().expect("Failed to open in-memory DB");

        let tables: usize = db
            .conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table' AND name IN ('enrichments', 'span_failures', 'enrichment_runs');",
                [],
                |row| row.get(0),
            )
            .unwrap();

        assert_eq!(tables, 3);
    }

    #[test]
    fn test_db_open_creates_parent_dir() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("nested").join("enrichment.db");
        let _db = Db::open(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_list_encoding() {
        let values = vec!["io".to_string(), "net".to_string()];
        assert_eq!(decode_list(&encode_list(&values)), values);
        assert!(decode_list("not json").is_empty());
    }
}
