use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::models::{RepositoryRunState, RunStatus};
use crate::query::RunStateView;

/// Per-repository run state, keyed by repository id.
///
/// Readers get clones. Mutation is crate-internal and happens from the
/// scheduler tick only.
#[derive(Default)]
pub struct RunStateTable {
    rows: DashMap<String, RepositoryRunState>,
}

impl RunStateTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, repo_id: &str) -> Option<RepositoryRunState> {
        self.rows.get(repo_id).map(|row| row.value().clone())
    }

    /// All rows, ordered by repository id.
    pub fn snapshot(&self) -> Vec<RepositoryRunState> {
        let mut rows: Vec<RepositoryRunState> =
            self.rows.iter().map(|row| row.value().clone()).collect();
        rows.sort_by(|a, b| a.repo_id.cmp(&b.repo_id));
        rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Insert a fresh row unless one exists. Returns whether it was added.
    pub(crate) fn insert(&self, repo_id: &str) -> bool {
        let mut added = false;
        self.rows.entry(repo_id.to_string()).or_insert_with(|| {
            added = true;
            RepositoryRunState::new(repo_id)
        });
        added
    }

    pub(crate) fn remove(&self, repo_id: &str) -> Option<RepositoryRunState> {
        self.rows.remove(repo_id).map(|(_, row)| row)
    }

    pub(crate) fn update<R>(
        &self,
        repo_id: &str,
        f: impl FnOnce(&mut RepositoryRunState) -> R,
    ) -> Option<R> {
        self.rows.get_mut(repo_id).map(|mut row| f(row.value_mut()))
    }

    /// `idle -> running`. Fails if the row is missing or already running.
    pub(crate) fn try_mark_running(&self, repo_id: &str, now: DateTime<Utc>) -> bool {
        self.update(repo_id, |state| {
            if state.running {
                return false;
            }
            state.running = true;
            state.status = RunStatus::Running;
            state.last_run_at = Some(now);
            state.next_due_at = None;
            true
        })
        .unwrap_or(false)
    }
}

impl RunStateView for RunStateTable {
    fn run_state(&self, repo_id: &str) -> Option<RepositoryRunState> {
        self.get(repo_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_running_once() {
        let table = RunStateTable::new();
        assert!(table.insert("a"));
        assert!(!table.insert("a"));

        let now = Utc::now();
        assert!(table.try_mark_running("a", now));
        assert!(!table.try_mark_running("a", now));
        assert!(!table.try_mark_running("missing", now));

        let row = table.get("a").unwrap();
        assert!(row.running);
        assert_eq!(row.status, RunStatus::Running);
        assert_eq!(row.last_run_at, Some(now));
    }

    #[test]
    fn test_snapshot_sorted_and_remove() {
        let table = RunStateTable::new();
        table.insert("b");
        table.insert("a");
        let ids: Vec<String> = table.snapshot().into_iter().map(|s| s.repo_id).collect();
        assert_eq!(ids, vec!["a", "b"]);

        assert!(table.remove("a").is_some());
        assert!(table.get("a").is_none());
        assert_eq!(table.len(), 1);
        assert_eq!(table.run_state("b").unwrap().status, RunStatus::Idle);
    }
}
