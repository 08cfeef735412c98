//! The scheduling cycle.
//!
//! Each cycle reaps stale runs, resolves the due set against the dependency
//! graph, dispatches each runnable job as an isolated worker process, and
//! supervises the workers until they finish, killing any that exceed their
//! timeout.

pub mod reaper;

pub use reaper::{StaleReaper, DEFAULT_STALE_AFTER};

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::dependency::{due_and_ready, DependencyError, JobDependency};
use crate::core::job::Job;
use crate::core::types::JobId;
use crate::store::{JobStore, LogEntry, StoreError};

/// How often the supervisor polls its workers and the daemon loop wakes.
pub const DEFAULT_POLL_INTERVAL: StdDuration = StdDuration::from_secs(1);

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Dependency(#[from] DependencyError),

    #[error("failed to spawn worker: {0}")]
    Spawn(std::io::Error),
}

/// Why a job in the cycle's candidate list was or wasn't dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Dispatched,
    SkippedNotDue,
    SkippedAlreadyRunning,
    SkippedDependenciesUnmet,
    SkippedDisabled,
}

/// Per-cycle overrides, used by the CLI's one-shot modes.
#[derive(Debug, Default, Clone)]
pub struct CycleOptions {
    /// Dispatch every enabled job regardless of schedule. Implies forced
    /// runs, so schedules are not advanced.
    pub force_all: bool,
    /// Restrict the cycle to these jobs.
    pub only: Option<HashSet<JobId>>,
}

/// What one cycle did.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub reaped: usize,
    pub outcomes: Vec<(JobId, DispatchOutcome)>,
}

impl CycleReport {
    pub fn dispatched(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| *o == DispatchOutcome::Dispatched)
            .count()
    }
}

/// Launches worker processes for dispatched jobs.
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    async fn spawn(&self, job: &Job, forced: bool) -> Result<Child, SchedulerError>;
}

/// Spawns the current executable's `run-job` subcommand, so each job runs
/// in its own process with its own store connection.
pub struct ExeWorkerSpawner {
    db_path: PathBuf,
}

impl ExeWorkerSpawner {
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }
}

#[async_trait]
impl WorkerSpawner for ExeWorkerSpawner {
    async fn spawn(&self, job: &Job, forced: bool) -> Result<Child, SchedulerError> {
        let exe = std::env::current_exe().map_err(SchedulerError::Spawn)?;
        let mut cmd = Command::new(exe);
        cmd.arg("run-job")
            .arg(job.id.to_string())
            .arg("--db")
            .arg(&self.db_path);
        if forced {
            cmd.arg("--forced");
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd.spawn().map_err(SchedulerError::Spawn)
    }
}

struct Worker {
    job_id: JobId,
    name: String,
    child: Child,
    dispatched_at: DateTime<Utc>,
    timeout: Option<StdDuration>,
    stdout: JoinHandle<String>,
    stderr: JoinHandle<String>,
}

/// Drives scheduling cycles against a store.
pub struct Scheduler {
    store: Arc<dyn JobStore>,
    spawner: Arc<dyn WorkerSpawner>,
    reaper: StaleReaper,
    hostname: String,
    poll_interval: StdDuration,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        spawner: Arc<dyn WorkerSpawner>,
        hostname: impl Into<String>,
    ) -> Self {
        let hostname = hostname.into();
        Self {
            reaper: StaleReaper::new(store.clone(), hostname.clone()),
            store,
            spawner,
            hostname,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: StdDuration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.reaper = self.reaper.with_stale_after(stale_after);
        self
    }

    /// Run one full cycle: reap, resolve, dispatch, supervise to completion.
    pub async fn run_cycle(
        &self,
        now: DateTime<Utc>,
        options: &CycleOptions,
    ) -> Result<CycleReport, SchedulerError> {
        let mut report = CycleReport {
            reaped: self.reaper.reap(now).await?,
            ..CycleReport::default()
        };

        let all_jobs: HashMap<JobId, Job> = self
            .store
            .list_jobs()
            .await?
            .into_iter()
            .map(|j| (j.id, j))
            .collect();
        let edges = self.store.list_dependencies().await?;
        let running: HashSet<JobId> = all_jobs
            .values()
            .filter(|j| j.is_running)
            .map(|j| j.id)
            .collect();

        let candidates = self
            .candidates(now, options, &mut report, &all_jobs, &edges, &running)
            .await?;

        // jobs running in the store plus everything claimed this cycle;
        // earlier dispatches in the same cycle count against later
        // candidates' wait conditions
        let mut active = running;
        let mut workers: Vec<Worker> = Vec::new();
        for job in candidates {
            // state may have moved since the due scan; re-fetch with one retry
            let current = match self.store.get_job(job.id).await {
                Ok(j) => j,
                Err(StoreError::NotFound(_)) => continue,
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "re-fetch failed, retrying once");
                    match self.store.get_job(job.id).await {
                        Ok(j) => j,
                        Err(e) => {
                            error!(job_id = %job.id, error = %e, "re-fetch failed, skipping");
                            continue;
                        }
                    }
                }
            };

            let outcome = if !current.enabled {
                DispatchOutcome::SkippedDisabled
            } else if current.is_running || active.contains(&current.id) {
                DispatchOutcome::SkippedAlreadyRunning
            } else if !options.force_all && !current.is_due(now, &self.hostname) {
                DispatchOutcome::SkippedNotDue
            } else if !dependencies_met(&current, &edges, &all_jobs, &active) {
                DispatchOutcome::SkippedDependenciesUnmet
            } else {
                DispatchOutcome::Dispatched
            };
            if outcome != DispatchOutcome::Dispatched {
                debug!(job_id = %current.id, name = %current.name, ?outcome, "not dispatching");
                report.outcomes.push((current.id, outcome));
                continue;
            }

            // claim before spawning, so cooperating schedulers and later
            // candidates in this cycle see the job as running; the worker
            // re-stamps the claim with its own pid on startup
            if let Err(e) = self
                .store
                .mark_running(current.id, &self.hostname, std::process::id(), Utc::now())
                .await
            {
                error!(job_id = %current.id, error = %e, "failed to claim job, skipping");
                continue;
            }
            let mut child = match self
                .spawner
                .spawn(&current, options.force_all || current.force_run)
                .await
            {
                Ok(child) => child,
                Err(e) => {
                    error!(job_id = %current.id, error = %e, "failed to spawn worker");
                    if let Err(e) = self.store.clear_running(current.id).await {
                        warn!(job_id = %current.id, error = %e, "failed to release claim");
                    }
                    continue;
                }
            };
            info!(job_id = %current.id, name = %current.name, "worker dispatched");
            active.insert(current.id);
            let stdout = drain_worker(child.stdout.take());
            let stderr = drain_worker(child.stderr.take());
            workers.push(Worker {
                job_id: current.id,
                name: current.name.clone(),
                child,
                dispatched_at: Utc::now(),
                timeout: (current.timeout_seconds > 0)
                    .then(|| StdDuration::from_secs(current.timeout_seconds as u64)),
                stdout,
                stderr,
            });
            report.outcomes.push((current.id, DispatchOutcome::Dispatched));
        }

        self.supervise(workers).await;
        Ok(report)
    }

    /// Resolve the cycle's candidate list, in dependency order.
    async fn candidates(
        &self,
        now: DateTime<Utc>,
        options: &CycleOptions,
        report: &mut CycleReport,
        all_jobs: &HashMap<JobId, Job>,
        edges: &[JobDependency],
        running: &HashSet<JobId>,
    ) -> Result<Vec<Job>, SchedulerError> {
        let restrict = |jobs: Vec<Job>| -> Vec<Job> {
            match &options.only {
                Some(only) => jobs.into_iter().filter(|j| only.contains(&j.id)).collect(),
                None => jobs,
            }
        };

        if options.force_all {
            let mut jobs: Vec<Job> = all_jobs
                .values()
                .filter(|j| j.enabled && !j.is_running && j.runs_on_host(&self.hostname))
                .cloned()
                .collect();
            jobs.sort_by_key(|j| j.id);
            return Ok(restrict(jobs));
        }

        let due = restrict(self.store.due_jobs(now, &self.hostname).await?);
        let due_ids: HashSet<JobId> = due.iter().map(|j| j.id).collect();

        let ordered = due_and_ready(due, all_jobs, edges, running)?;
        let kept: HashSet<JobId> = ordered.iter().map(|j| j.id).collect();
        for id in &due_ids {
            if !kept.contains(id) {
                report
                    .outcomes
                    .push((*id, DispatchOutcome::SkippedDependenciesUnmet));
            }
        }
        Ok(ordered)
    }

    /// Poll workers until all have exited, killing any that exceed their
    /// timeout and recording a synthetic off-schedule failure for them.
    async fn supervise(&self, mut workers: Vec<Worker>) {
        while !workers.is_empty() {
            let mut still_running = Vec::with_capacity(workers.len());
            for mut worker in workers {
                match worker.child.try_wait() {
                    Ok(Some(status)) => {
                        debug!(
                            job_id = %worker.job_id,
                            name = %worker.name,
                            code = ?status.code(),
                            "worker exited"
                        );
                    }
                    Ok(None) => {
                        let elapsed = (Utc::now() - worker.dispatched_at)
                            .to_std()
                            .unwrap_or_default();
                        match worker.timeout {
                            Some(timeout) if elapsed >= timeout => {
                                self.kill_timed_out(worker, timeout).await;
                            }
                            _ => still_running.push(worker),
                        }
                    }
                    Err(e) => {
                        warn!(job_id = %worker.job_id, error = %e, "worker wait failed");
                    }
                }
            }
            workers = still_running;
            if !workers.is_empty() {
                tokio::time::sleep(self.poll_interval).await;
            }
        }
    }

    async fn kill_timed_out(&self, mut worker: Worker, timeout: StdDuration) {
        warn!(
            job_id = %worker.job_id,
            name = %worker.name,
            timeout_seconds = timeout.as_secs(),
            "worker exceeded timeout, killing"
        );
        if let Err(e) = worker.child.kill().await {
            error!(job_id = %worker.job_id, error = %e, "failed to kill worker");
        }
        let stdout = worker.stdout.await.unwrap_or_default();
        let mut stderr = worker.stderr.await.unwrap_or_default();
        stderr.push_str(&format!(
            "Job exceeded timeout of {} seconds and was terminated.\n",
            timeout.as_secs()
        ));

        if let Err(e) = self.store.clear_running(worker.job_id).await {
            warn!(job_id = %worker.job_id, error = %e, "failed to clear killed worker");
        }
        let now = Utc::now();
        let run_start = match self.store.get_job(worker.job_id).await {
            Ok(job) => job.last_run_start.unwrap_or(worker.dispatched_at),
            Err(_) => worker.dispatched_at,
        };
        let entry = LogEntry::new(
            worker.job_id,
            run_start.min(now),
            now,
            stdout,
            stderr,
            false,
            false,
            self.hostname.clone(),
        );
        if let Err(e) = self.store.append_log(entry).await {
            warn!(job_id = %worker.job_id, error = %e, "failed to log timeout kill");
        }
    }

    /// Daemon loop: recover running flags once, then cycle until shutdown.
    pub async fn run_forever(&self, shutdown: CancellationToken) -> Result<(), SchedulerError> {
        let recovered = self.store.clear_all_running().await?;
        if recovered > 0 {
            warn!(recovered, "cleared running flags left by a previous scheduler");
        }
        info!(hostname = %self.hostname, "scheduler started");
        let options = CycleOptions::default();
        loop {
            if shutdown.is_cancelled() {
                info!("scheduler shutting down");
                return Ok(());
            }
            match self.run_cycle(Utc::now(), &options).await {
                Ok(report) if report.dispatched() > 0 || report.reaped > 0 => {
                    info!(
                        dispatched = report.dispatched(),
                        reaped = report.reaped,
                        "cycle complete"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "cycle failed"),
            }
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}

/// Dispatch-time dependency re-check. `active` holds the jobs running in
/// the store plus those already claimed earlier in this cycle, so a
/// `wait_for_completion` edge defers the dependent to a later cycle when
/// its dependee was just dispatched.
fn dependencies_met(
    job: &Job,
    edges: &[JobDependency],
    all_jobs: &HashMap<JobId, Job>,
    active: &HashSet<JobId>,
) -> bool {
    edges
        .iter()
        .filter(|e| e.dependent == job.id)
        .all(|e| match all_jobs.get(&e.dependee) {
            Some(dependee) => e.criteria_met(job, dependee, active),
            // dangling edge: the dependee was deleted, nothing to wait on
            None => true,
        })
}

/// Drain a worker's output stream to a string, teeing lines to the log.
fn drain_worker<R>(stream: Option<R>) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(stream) = stream else {
            return String::new();
        };
        let mut lines = BufReader::new(stream).lines();
        let mut body = String::new();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target: "cadence::worker", "{line}");
            body.push_str(&line);
            body.push('\n');
        }
        body
    })
}
