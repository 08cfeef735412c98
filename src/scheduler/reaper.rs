//! Stale-run reaper.
//!
//! A run whose liveness timestamp stops advancing is presumed dead: the
//! worker crashed, the host rebooted, or the process hung. The reaper marks
//! such runs failed so the job can be scheduled again, and when the dead
//! process belongs to this host it escalates through signals to make sure
//! it is actually gone.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::core::job::Job;
use crate::store::{JobStore, LogEntry, StoreError};

/// Runs without a heartbeat for this long are considered dead.
pub const DEFAULT_STALE_AFTER: Duration = Duration::minutes(5);

/// Written to the synthetic log entry of a reaped run.
const STALE_MESSAGE: &str = "Job became stale and was marked as terminated.";

/// Escalation order; each signal gets a grace period before the next.
const KILL_SIGNALS: [i32; 4] = [libc::SIGINT, libc::SIGABRT, libc::SIGTERM, libc::SIGKILL];
const KILL_GRACE: StdDuration = StdDuration::from_millis(500);

/// Finds and clears runs that died without completing.
pub struct StaleReaper {
    store: Arc<dyn JobStore>,
    hostname: String,
    stale_after: Duration,
}

impl StaleReaper {
    pub fn new(store: Arc<dyn JobStore>, hostname: impl Into<String>) -> Self {
        Self {
            store,
            hostname: hostname.into(),
            stale_after: DEFAULT_STALE_AFTER,
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Reap every stale run, returning how many were cleared. Safe to call
    /// repeatedly; a reaped job is no longer running and won't match again.
    pub async fn reap(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let stale = self.store.stale_jobs(now, self.stale_after).await?;
        let mut reaped = 0;
        for job in stale {
            warn!(
                job_id = %job.id,
                name = %job.name,
                last_heartbeat = ?job.liveness_timestamp(),
                "stale run detected"
            );
            // Only signal processes we own; a run claimed by another host
            // still gets its state cleared so it can be rescheduled.
            if job.current_hostname.as_deref() == Some(self.hostname.as_str()) {
                if let Some(pid) = job.current_pid {
                    self.terminate(pid).await;
                }
            }
            self.store.mark_stale_failure(job.id).await?;
            let run_start = job.last_run_start.unwrap_or(now);
            let entry = LogEntry::new(
                job.id,
                run_start,
                now.max(run_start),
                String::new(),
                STALE_MESSAGE.to_string(),
                false,
                true,
                self.hostname.clone(),
            );
            if let Err(e) = self.store.append_log(entry).await {
                warn!(job_id = %job.id, error = %e, "failed to log stale termination");
            }
            info!(job_id = %job.id, name = %job.name, "stale run cleared");
            reaped += 1;
        }
        Ok(reaped)
    }

    /// Escalate through the signal ladder until the process is gone.
    async fn terminate(&self, pid: u32) {
        if !pid_exists(pid) {
            debug!(pid, "stale process already gone");
            return;
        }
        for signal in KILL_SIGNALS {
            debug!(pid, signal, "signalling stale process");
            // SAFETY: plain kill(2) call; no memory is shared with the target
            unsafe {
                libc::kill(pid as libc::pid_t, signal);
            }
            tokio::time::sleep(KILL_GRACE).await;
            if !pid_exists(pid) {
                return;
            }
        }
        warn!(pid, "stale process survived SIGKILL");
    }
}

/// Whether a process with this pid exists (signal 0 probes without sending).
fn pid_exists(pid: u32) -> bool {
    // SAFETY: signal 0 performs permission and existence checks only
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

/// True when the job would be considered stale at `now`. Mirror of the
/// store-side filter, for callers inspecting jobs they already hold.
pub fn is_stale(job: &Job, now: DateTime<Utc>, stale_after: Duration) -> bool {
    if !job.is_running {
        return false;
    }
    match job.liveness_timestamp() {
        Some(t) => t < now - stale_after,
        None => true,
    }
}
