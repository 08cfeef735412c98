//! Persistent job state.
//!
//! The [`JobStore`] trait abstracts over storage backends. Every run-state
//! transition is a field-scoped atomic operation on the store; callers never
//! read-modify-write whole jobs to flip a flag, which is what keeps a
//! scheduler, a worker process, and its heartbeat from clobbering each other.

mod memory;
mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::dependency::JobDependency;
use crate::core::job::Job;
use crate::core::types::{JobId, LogId};

/// Bodies longer than this are stored as a head/tail sample.
const MAX_LOG_BODY: usize = 10_000;

/// Errors that can occur in storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Requested item doesn't exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A job with this name already exists.
    #[error("duplicate job name: {0}")]
    DuplicateName(String),

    /// A lock was poisoned (a thread panicked while holding it).
    #[error("storage lock poisoned")]
    LockPoisoned,

    /// Serialization/deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Backend-specific error.
    #[error("storage error: {0}")]
    Backend(String),
}

/// What the heartbeat observed while writing its liveness timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatTick {
    /// A stop was requested; the flag has been cleared atomically.
    pub force_stop: bool,
}

/// The final state of a finished run, applied in one atomic update.
#[derive(Debug, Clone)]
pub struct RunCompletion {
    pub run_start: DateTime<Utc>,
    pub run_end: DateTime<Utc>,
    pub success: bool,
    /// New schedule slot; `None` leaves the existing value in place.
    pub next_run: Option<DateTime<Utc>>,
}

/// One execution record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: LogId,
    pub job_id: JobId,
    pub run_start: DateTime<Utc>,
    pub run_end: DateTime<Utc>,
    /// Derived from the run bounds at construction.
    pub duration_seconds: i64,
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    /// False when the run was terminated for exceeding its timeout.
    pub on_time: bool,
    pub hostname: String,
}

impl LogEntry {
    /// Build an entry, deriving the duration. Long bodies are reduced to a
    /// head/tail sample before storage.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job_id: JobId,
        run_start: DateTime<Utc>,
        run_end: DateTime<Utc>,
        stdout: String,
        stderr: String,
        success: bool,
        on_time: bool,
        hostname: String,
    ) -> Self {
        let duration_seconds = (run_end - run_start).num_seconds();
        assert!(duration_seconds >= 0, "run ended before it started");
        Self {
            id: LogId::new(),
            job_id,
            run_start,
            run_end,
            duration_seconds,
            stdout: truncate_middle(&stdout, MAX_LOG_BODY),
            stderr: truncate_middle(&stderr, MAX_LOG_BODY),
            success,
            on_time,
            hostname,
        }
    }

    /// Single-line 40-character sample of stdout for listings.
    pub fn stdout_sample(&self) -> String {
        sample_line(&self.stdout)
    }

    /// Single-line 40-character sample of stderr for listings.
    pub fn stderr_sample(&self) -> String {
        sample_line(&self.stderr)
    }
}

fn sample_line(text: &str) -> String {
    let line = text.lines().next().unwrap_or("");
    let mut out: String = line.chars().take(40).collect();
    if line.chars().count() > 40 || text.lines().count() > 1 {
        out.push_str("...");
    }
    out
}

/// Keep the head and tail of an over-long body, marking the elision.
fn truncate_middle(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let half = max / 2;
    let head_end = (0..=half).rev().find(|i| text.is_char_boundary(*i)).unwrap_or(0);
    let tail_start = (text.len() - half..text.len())
        .find(|i| text.is_char_boundary(*i))
        .unwrap_or(text.len());
    format!(
        "{}\n... ({} bytes elided) ...\n{}",
        &text[..head_end],
        tail_start - head_end,
        &text[tail_start..]
    )
}

/// Average duration of recent successful runs, for run-length estimates.
pub fn estimate_run_seconds(logs: &[LogEntry]) -> Option<i64> {
    let durations: Vec<i64> = logs
        .iter()
        .filter(|l| l.success)
        .map(|l| l.duration_seconds)
        .collect();
    if durations.is_empty() {
        return None;
    }
    Some(durations.iter().sum::<i64>() / durations.len() as i64)
}

/// Storage backend for jobs, dependency edges, and execution logs.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job and assign its id. Names are unique.
    async fn create_job(&self, job: Job) -> Result<JobId, StoreError>;

    /// Fetch a job by id.
    async fn get_job(&self, id: JobId) -> Result<Job, StoreError>;

    /// Fetch a job by name.
    async fn find_job_by_name(&self, name: &str) -> Result<Option<Job>, StoreError>;

    /// List all jobs, ordered by id.
    async fn list_jobs(&self) -> Result<Vec<Job>, StoreError>;

    /// Full update of an existing job. Prunes its logs to
    /// `maximum_log_entries` as a side effect; a limit of 0 keeps
    /// everything.
    async fn save_job(&self, job: &Job) -> Result<(), StoreError>;

    /// Delete a job and its edges and logs.
    async fn delete_job(&self, id: JobId) -> Result<(), StoreError>;

    /// Add a dependency edge.
    async fn add_dependency(&self, dep: JobDependency) -> Result<(), StoreError>;

    /// Remove one dependency edge.
    async fn remove_dependency(&self, dependent: JobId, dependee: JobId)
        -> Result<(), StoreError>;

    /// Remove every edge whose dependent is the given job.
    async fn clear_dependencies_of(&self, dependent: JobId) -> Result<(), StoreError>;

    /// All dependency edges.
    async fn list_dependencies(&self) -> Result<Vec<JobDependency>, StoreError>;

    /// Jobs due to run now on this host: enabled, not running, hostname
    /// pinning honored, and scheduled time reached or run forced.
    async fn due_jobs(&self, now: DateTime<Utc>, hostname: &str) -> Result<Vec<Job>, StoreError>;

    /// Jobs currently marked running.
    async fn running_jobs(&self) -> Result<Vec<Job>, StoreError>;

    /// Running jobs whose liveness timestamp is older than the threshold
    /// (or that have no liveness timestamp at all).
    async fn stale_jobs(
        &self,
        now: DateTime<Utc>,
        threshold: Duration,
    ) -> Result<Vec<Job>, StoreError>;

    /// Transition into the running state: records host, pid, and run start,
    /// stamps an initial heartbeat, and resets the progress counters.
    async fn mark_running(
        &self,
        id: JobId,
        hostname: &str,
        pid: u32,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Write a liveness timestamp and atomically read-and-clear the force
    /// flags, reporting whether a stop was requested.
    async fn record_heartbeat(
        &self,
        id: JobId,
        now: DateTime<Utc>,
    ) -> Result<HeartbeatTick, StoreError>;

    /// Update the progress counters of a running job.
    async fn update_progress(&self, id: JobId, total: u32, complete: u32)
        -> Result<(), StoreError>;

    /// Atomic completion: clears the running flag, host, pid, and force
    /// flags; records the run bounds and outcome; optionally advances
    /// `next_run`; rolls the progress counter up on success.
    async fn complete_run(&self, id: JobId, completion: &RunCompletion) -> Result<(), StoreError>;

    /// Reaper transition: clear running state and mark the last run failed
    /// without touching the schedule.
    async fn mark_stale_failure(&self, id: JobId) -> Result<(), StoreError>;

    /// Clear the running flag and ownership fields only. Safety net for
    /// runs whose completion update failed to land.
    async fn clear_running(&self, id: JobId) -> Result<(), StoreError>;

    /// Request or clear a forced run.
    async fn set_force_run(&self, id: JobId, value: bool) -> Result<(), StoreError>;

    /// Request or clear a forced stop.
    async fn set_force_stop(&self, id: JobId, value: bool) -> Result<(), StoreError>;

    /// Clear the running flag on every job; returns how many were cleared.
    /// Used on daemon startup to recover from a crashed scheduler.
    async fn clear_all_running(&self) -> Result<u64, StoreError>;

    /// Append an execution record, pruning the job's history beyond its
    /// retention limit. A limit of 0 disables pruning.
    async fn append_log(&self, entry: LogEntry) -> Result<(), StoreError>;

    /// Most recent log entries for a job, newest first.
    async fn list_logs(&self, job_id: JobId, limit: usize) -> Result<Vec<LogEntry>, StoreError>;

    /// The newest log entry for a job.
    async fn latest_log(&self, job_id: JobId) -> Result<Option<LogEntry>, StoreError>;
}
