use super::Db;
use crate::error::StoreError;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};
use serde::Serialize;

/// Failure history of one span.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpanFailure {
    pub span_hash: String,
    pub repo_id: String,
    pub consecutive_failures: u32,
    /// Stable name of the last [`crate::error::FailureKind`], or a free-form
    /// reason for local failures.
    pub last_error: String,
    pub last_failed_at: DateTime<Utc>,
}

impl SpanFailure {
    /// Whether the span should sit out this run: at least `threshold`
    /// consecutive failures and the last one within `cooldown`.
    pub fn in_cooldown(&self, threshold: u32, cooldown: chrono::Duration, now: DateTime<Utc>) -> bool {
        self.consecutive_failures >= threshold && now - self.last_failed_at < cooldown
    }
}

fn map_failure(row: &Row<'_>) -> rusqlite::Result<SpanFailure> {
    Ok(SpanFailure {
        span_hash: row.get(0)?,
        repo_id: row.get(1)?,
        consecutive_failures: row.get(2)?,
        last_error: row.get(3)?,
        last_failed_at: row.get(4)?,
    })
}

impl Db {
    /// Increment the span's failure counter and remember the error.
    /// Returns the new consecutive count.
    pub fn record_span_failure(
        &self,
        repo_id: &str,
        span_hash: &str,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        let count: u32 = self.conn.query_row(
            r#"
            INSERT INTO span_failures (span_hash, repo_id, consecutive_failures, last_error, last_failed_at)
            VALUES (?, ?, 1, ?, ?)
            ON CONFLICT(span_hash) DO UPDATE SET
                repo_id = excluded.repo_id,
                consecutive_failures = span_failures.consecutive_failures + 1,
                last_error = excluded.last_error,
                last_failed_at = excluded.last_failed_at
            RETURNING consecutive_failures
            "#,
            params![span_hash, repo_id, error, at],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn clear_span_failure(&self, span_hash: &str) -> Result<(), StoreError> {
        self.conn
            .execute("DELETE FROM span_failures WHERE span_hash = ?", params![span_hash])?;
        Ok(())
    }

    pub fn span_failure(&self, span_hash: &str) -> Result<Option<SpanFailure>, StoreError> {
        let failure = self
            .conn
            .query_row(
                "SELECT span_hash, repo_id, consecutive_failures, last_error, last_failed_at FROM span_failures WHERE span_hash = ?",
                params![span_hash],
                map_failure,
            )
            .optional()?;
        Ok(failure)
    }

    /// All failure rows for a repository, worst first.
    pub fn failures_for_repo(&self, repo_id: &str) -> Result<Vec<SpanFailure>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT span_hash, repo_id, consecutive_failures, last_error, last_failed_at FROM span_failures WHERE repo_id = ? ORDER BY consecutive_failures DESC, span_hash",
        )?;
        let rows = stmt.query_map(params![repo_id], map_failure)?;

        let mut failures = Vec::new();
        for row in rows {
            failures.push(row?);
        }
        Ok(failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_failure_counter_increments_and_clears() {
        let db = Db::open_in_memory().unwrap();
        let now = Utc::now();

        assert_eq!(db.record_span_failure("r", "h", "timeout", now).unwrap(), 1);
        assert_eq!(
            db.record_span_failure("r", "h", "invalid_response", now).unwrap(),
            2
        );

        let failure = db.span_failure("h").unwrap().unwrap();
        assert_eq!(failure.consecutive_failures, 2);
        assert_eq!(failure.last_error, "invalid_response");

        db.clear_span_failure("h").unwrap();
        assert!(db.span_failure("h").unwrap().is_none());
        // Clearing a span with no history is a no-op
        db.clear_span_failure("h").unwrap();
    }

    #[test]
    fn test_cooldown_window() {
        let now = Utc::now();
        let failure = SpanFailure {
            span_hash: "h".into(),
            repo_id: "r".into(),
            consecutive_failures: 3,
            last_error: "timeout".into(),
            last_failed_at: now - Duration::minutes(10),
        };
        assert!(failure.in_cooldown(3, Duration::hours(1), now));
        assert!(!failure.in_cooldown(4, Duration::hours(1), now));
        assert!(!failure.in_cooldown(3, Duration::minutes(5), now));
    }

    #[test]
    fn test_failures_for_repo() {
        let db = Db::open_in_memory().unwrap();
        let now = Utc::now();
        db.record_span_failure("r", "a", "timeout", now).unwrap();
        db.record_span_failure("r", "b", "timeout", now).unwrap();
        db.record_span_failure("r", "b", "timeout", now).unwrap();
        db.record_span_failure("other", "c", "timeout", now).unwrap();

        let failures = db.failures_for_repo("r").unwrap();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].span_hash, "b");
        assert_eq!(failures[0].consecutive_failures, 2);
    }
}
