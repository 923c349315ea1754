/// Worker pool that drives periodic enrichment runs per repository.
///
/// The scheduler owns every `RepositoryRunState` row. Runs execute on
/// spawned tasks and only report back through their join handles; the
/// tick harvests those results and applies them, so all state mutation
/// happens in one place. At most `max_concurrent_repos` runs execute at
/// once, and never two for the same repository.
pub mod backoff;
pub mod state;

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::error::RunError;
use crate::models::{RepoHandle, RepositoryRunState, RunStatus};

pub use backoff::{IdleBackoff, failure_multiplier};
pub use state::RunStateTable;

/// How long a cancelled run gets to wind down before it is aborted.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// What a successful run reports back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Spans newly enriched by this run.
    pub enriched: usize,
    /// Head revision observed at the end of the run.
    pub revision: Option<String>,
}

/// One unit of per-repository work.
#[async_trait]
pub trait RepoJob: Send + Sync + 'static {
    async fn run(&self, repo: &RepoHandle, cancel: CancellationToken) -> Result<RunReport, RunError>;
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub max_concurrent_repos: usize,
    pub poll_interval: Duration,
    pub tick_interval: Duration,
    pub idle_runs_before_backoff: usize,
    pub max_idle_multiplier: u32,
    pub degraded_after_failures: u32,
    pub max_failure_multiplier: u32,
    pub run_deadline: Duration,
}

impl SchedulerSettings {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            max_concurrent_repos: config.max_concurrent_repos.max(1),
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            tick_interval: Duration::from_millis(config.tick_interval_ms.max(1)),
            idle_runs_before_backoff: config.idle_runs_before_backoff,
            max_idle_multiplier: config.max_idle_multiplier,
            degraded_after_failures: config.degraded_after_failures,
            max_failure_multiplier: config.max_failure_multiplier,
            run_deadline: Duration::from_secs(config.run_deadline_secs),
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default())
    }
}

/// What one tick did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub started: Vec<String>,
    pub finished: Vec<String>,
}

struct ActiveRun {
    cancel: CancellationToken,
    task: JoinHandle<Result<RunReport, RunError>>,
}

struct RepoEntry {
    handle: RepoHandle,
    registered_at: Instant,
    last_finished: Option<Instant>,
    active: Option<ActiveRun>,
}

struct Inner {
    repos: HashMap<String, RepoEntry>,
    idle: IdleBackoff,
}

pub struct Scheduler {
    job: Arc<dyn RepoJob>,
    settings: SchedulerSettings,
    states: Arc<RunStateTable>,
    slots: Arc<Semaphore>,
    inner: Mutex<Inner>,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(job: Arc<dyn RepoJob>, settings: SchedulerSettings) -> Self {
        let idle = IdleBackoff::new(settings.idle_runs_before_backoff, settings.max_idle_multiplier);
        Self {
            job,
            slots: Arc::new(Semaphore::new(settings.max_concurrent_repos)),
            settings,
            states: Arc::new(RunStateTable::new()),
            inner: Mutex::new(Inner {
                repos: HashMap::new(),
                idle,
            }),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Shared read-only view of the run state table.
    pub fn run_states(&self) -> Arc<RunStateTable> {
        Arc::clone(&self.states)
    }

    /// Concurrency slots not held by a run.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Register a repository. Re-registering an id updates its path and
    /// returns `false`.
    pub async fn register_repo(&self, repo_id: &str, path: impl Into<PathBuf>) -> bool {
        let handle = RepoHandle::new(repo_id, path);
        let mut inner = self.inner.lock().await;
        match inner.repos.entry(repo_id.to_string()) {
            Entry::Occupied(mut existing) => {
                existing.get_mut().handle = handle;
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(RepoEntry {
                    handle,
                    registered_at: Instant::now(),
                    last_finished: None,
                    active: None,
                });
                self.states.insert(repo_id);
                info!(repo = %repo_id, "Registered repository");
                true
            }
        }
    }

    /// Remove a repository, cancelling its run if one is active. Returns
    /// whether the repository was registered.
    pub async fn unregister_repo(&self, repo_id: &str) -> bool {
        let entry = {
            let mut inner = self.inner.lock().await;
            let entry = inner.repos.remove(repo_id);
            // Dropped under the lock, so a re-registration during the
            // cancel grace keeps its fresh row.
            if entry.is_some() {
                self.states.remove(repo_id);
            }
            entry
        };
        let Some(entry) = entry else {
            return false;
        };

        if let Some(active) = entry.active {
            info!(repo = %repo_id, "Cancelling active run of unregistered repository");
            let outcome = stop_run(active).await;
            debug!(repo = %repo_id, outcome = ?outcome.as_ref().err(), "Cancelled run wound down");
        }
        info!(repo = %repo_id, "Unregistered repository");
        true
    }

    pub fn status(&self, repo_id: &str) -> Option<RepositoryRunState> {
        self.states.get(repo_id)
    }

    pub fn statuses(&self) -> Vec<RepositoryRunState> {
        self.states.snapshot()
    }

    /// Harvest finished runs, then start every due repository a slot is
    /// free for.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        let mut inner = self.inner.lock().await;

        // Harvest.
        let finished: Vec<String> = inner
            .repos
            .iter()
            .filter(|(_, e)| e.active.as_ref().is_some_and(|a| a.task.is_finished()))
            .map(|(id, _)| id.clone())
            .collect();
        for id in finished {
            let Some(entry) = inner.repos.get_mut(&id) else {
                continue;
            };
            let Some(active) = entry.active.take() else {
                continue;
            };
            let outcome = join_outcome(active.task.await);
            entry.last_finished = Some(Instant::now());
            if let Some(enriched) = self.apply_outcome(&id, outcome) {
                let multiplier = inner.idle.record(enriched);
                if multiplier > 1 {
                    debug!(multiplier, idle_runs = inner.idle.idle_streak(), "Idle back-off in effect");
                }
            }
            report.finished.push(id);
        }

        if self.shutdown.is_cancelled() {
            return report;
        }

        // Schedule.
        let now = Instant::now();
        let idle_multiplier = inner.idle.multiplier();
        let mut due: Vec<(Instant, String)> = Vec::new();
        for (id, entry) in &inner.repos {
            let state = self.states.get(id);
            let next = self.next_due(entry, state.as_ref(), idle_multiplier);
            if entry.active.is_some() {
                debug!(repo = %id, "Run still in progress, skipping");
                continue;
            }
            if next > now {
                let wait = next.saturating_duration_since(now);
                self.states.update(id, |s| {
                    s.next_due_at = chrono::Duration::from_std(wait).ok().map(|d| Utc::now() + d);
                });
                continue;
            }
            due.push((next, id.clone()));
        }
        due.sort();

        for (_, id) in due {
            let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() else {
                debug!(repo = %id, "No free slot, deferring run");
                break;
            };
            let Some(entry) = inner.repos.get_mut(&id) else {
                continue;
            };
            if !self.states.try_mark_running(&id, Utc::now()) {
                debug!(repo = %id, "Repository already running, skipping");
                continue;
            }

            let cancel = self.shutdown.child_token();
            let job = Arc::clone(&self.job);
            let handle = entry.handle.clone();
            let deadline = self.settings.run_deadline;
            let run_cancel = cancel.clone();

            let task = tokio::spawn(async move {
                let _permit = permit;
                match tokio::time::timeout(deadline, job.run(&handle, run_cancel.clone())).await {
                    Ok(result) => result,
                    Err(_) => {
                        run_cancel.cancel();
                        Err(RunError::Timeout(deadline))
                    }
                }
            });

            entry.active = Some(ActiveRun { cancel, task });
            debug!(repo = %id, "Started run");
            report.started.push(id);
        }

        report
    }

    /// Tick until shutdown is requested, then wind down active runs.
    pub async fn run(&self) {
        info!(
            max_concurrent = self.settings.max_concurrent_repos,
            poll_secs = self.settings.poll_interval.as_secs(),
            "Scheduler started"
        );
        let mut ticker = tokio::time::interval(self.settings.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
        self.drain().await;
        info!("Scheduler stopped");
    }

    /// Cancel every active run and wait for all of them to release their
    /// slots. Cancelled runs are recorded as failures.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.drain().await;
    }

    async fn drain(&self) {
        let mut inner = self.inner.lock().await;
        let ids: Vec<String> = inner
            .repos
            .iter()
            .filter(|(_, e)| e.active.is_some())
            .map(|(id, _)| id.clone())
            .collect();

        for id in ids {
            let Some(entry) = inner.repos.get_mut(&id) else {
                continue;
            };
            let Some(active) = entry.active.take() else {
                continue;
            };
            let outcome = stop_run(active).await;
            entry.last_finished = Some(Instant::now());
            self.apply_outcome(&id, outcome);
        }
    }

    fn next_due(&self, entry: &RepoEntry, state: Option<&RepositoryRunState>, idle_multiplier: u32) -> Instant {
        let Some(last) = entry.last_finished else {
            return entry.registered_at;
        };
        let failure = state.map_or(1, |s| s.backoff_multiplier.max(1));
        last + self
            .settings
            .poll_interval
            .saturating_mul(idle_multiplier.max(failure))
    }

    /// Record a finished run. Returns the number of spans enriched when the
    /// run succeeded.
    fn apply_outcome(&self, repo_id: &str, outcome: Result<RunReport, RunError>) -> Option<usize> {
        let settings = &self.settings;
        self.states
            .update(repo_id, |state| {
                state.running = false;
                match outcome {
                    Ok(report) => {
                        state.status = RunStatus::Success;
                        state.consecutive_failures = 0;
                        state.backoff_multiplier = 1;
                        state.degraded = false;
                        state.last_error = None;
                        state.last_enriched = report.enriched;
                        if report.revision.is_some() {
                            state.last_success_commit = report.revision;
                        }
                        info!(repo = %repo_id, enriched = report.enriched, "Run succeeded");
                        Some(report.enriched)
                    }
                    Err(e) => {
                        state.status = RunStatus::Failure;
                        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                        state.last_error = Some(format!("{}: {e}", e.reason()));
                        state.last_enriched = 0;
                        state.backoff_multiplier = failure_multiplier(
                            state.consecutive_failures,
                            settings.degraded_after_failures,
                            settings.max_failure_multiplier,
                        );
                        warn!(
                            repo = %repo_id,
                            reason = e.reason(),
                            failures = state.consecutive_failures,
                            error = %e,
                            "Run failed"
                        );
                        if !state.degraded
                            && state.consecutive_failures >= settings.degraded_after_failures.max(1)
                        {
                            state.degraded = true;
                            warn!(
                                repo = %repo_id,
                                failures = state.consecutive_failures,
                                multiplier = state.backoff_multiplier,
                                "Repository degraded, backing off"
                            );
                        }
                        None
                    }
                }
            })
            .flatten()
    }
}

impl crate::query::RunStateView for Scheduler {
    fn run_state(&self, repo_id: &str) -> Option<RepositoryRunState> {
        self.status(repo_id)
    }
}

fn join_outcome(
    joined: Result<Result<RunReport, RunError>, tokio::task::JoinError>,
) -> Result<RunReport, RunError> {
    match joined {
        Ok(outcome) => outcome,
        Err(e) if e.is_cancelled() => Err(RunError::Cancelled),
        Err(e) => Err(RunError::Crashed(e.to_string())),
    }
}

/// Cancel a run and wait for it, aborting it after the grace period.
async fn stop_run(active: ActiveRun) -> Result<RunReport, RunError> {
    active.cancel.cancel();
    let mut task = active.task;
    match tokio::time::timeout(CANCEL_GRACE, &mut task).await {
        Ok(joined) => join_outcome(joined),
        Err(_) => {
            task.abort();
            join_outcome(task.await)
        }
    }
}
