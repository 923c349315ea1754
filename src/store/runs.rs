use super::Db;
use crate::error::StoreError;
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Outcome counts of one enrichment batch.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Calls actually made, keyed by backend id.
    #[serde(default)]
    pub backend_calls: BTreeMap<String, u32>,
    #[serde(default)]
    pub estimated_cost: f64,
}

impl BatchSummary {
    pub fn total_calls(&self) -> u32 {
        self.backend_calls.values().sum()
    }
}

/// A persisted batch summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunRecord {
    pub id: i64,
    pub repo_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub summary: BatchSummary,
    pub outcome: String,
}

impl Db {
    /// Append a batch summary to the run log.
    pub fn record_run(
        &self,
        repo_id: &str,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        summary: &BatchSummary,
        outcome: &str,
    ) -> Result<i64, StoreError> {
        let calls = serde_json::to_string(&summary.backend_calls)?;
        self.conn.execute(
            "INSERT INTO enrichment_runs (repo_id, started_at, finished_at, attempted, succeeded, failed, skipped, backend_calls, estimated_cost, outcome)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                repo_id,
                started_at,
                finished_at,
                summary.attempted,
                summary.succeeded,
                summary.failed,
                summary.skipped,
                calls,
                summary.estimated_cost,
                outcome,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Most recent runs for a repository, newest first.
    pub fn recent_runs(&self, repo_id: &str, limit: usize) -> Result<Vec<RunRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, repo_id, started_at, finished_at, attempted, succeeded, failed, skipped, backend_calls, estimated_cost, outcome
             FROM enrichment_runs WHERE repo_id = ? ORDER BY id DESC LIMIT ?",
        )?;
        let rows = stmt.query_map(params![repo_id, limit], |row| {
            let calls: String = row.get(8)?;
            Ok(RunRecord {
                id: row.get(0)?,
                repo_id: row.get(1)?,
                started_at: row.get(2)?,
                finished_at: row.get(3)?,
                summary: BatchSummary {
                    attempted: row.get(4)?,
                    succeeded: row.get(5)?,
                    failed: row.get(6)?,
                    skipped: row.get(7)?,
                    backend_calls: serde_json::from_str(&calls).unwrap_or_default(),
                    estimated_cost: row.get(9)?,
                },
                outcome: row.get(10)?,
            })
        })?;

        let mut runs = Vec::new();
        for row in rows {
            runs.push(row?);
        }
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_list_runs() {
        let db = Db::open_in_memory().unwrap();
        let now = Utc::now();

        let mut summary = BatchSummary {
            attempted: 3,
            succeeded: 2,
            failed: 1,
            ..Default::default()
        };
        summary.backend_calls.insert("local".into(), 4);
        summary.estimated_cost = 0.25;

        db.record_run("r", now, now, &summary, "success").unwrap();
        db.record_run("r", now, now, &BatchSummary::default(), "cancelled")
            .unwrap();
        db.record_run("other", now, now, &summary, "success").unwrap();

        let runs = db.recent_runs("r", 10).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].outcome, "cancelled");
        assert_eq!(runs[1].summary, summary);
        assert_eq!(runs[1].summary.total_calls(), 4);

        assert_eq!(db.recent_runs("r", 1).unwrap().len(), 1);
    }
}
