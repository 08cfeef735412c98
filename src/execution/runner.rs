//! Single-job execution.
//!
//! [`JobRunner::execute`] drives one run end to end: claim the job, keep a
//! heartbeat while the command runs, judge the outcome, advance the
//! schedule, and record the log entry and notifications. A run succeeds
//! exactly when it produced no stderr; every failure path writes there.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::job::{CommandSpec, Job};
use crate::core::types::JobId;
use crate::execution::command::{
    parse_args, run_raw, CommandContext, CommandRegistry,
};
use crate::execution::heartbeat::{
    HeartbeatMonitor, ProgressRecorder, DEFAULT_HEARTBEAT_INTERVAL,
};
use crate::notify::{
    failure_notification, success_notification, ErrorCallback, LogNotifier, Notifier,
};
use crate::store::{JobStore, LogEntry, RunCompletion, StoreError};

/// Appended to stderr when a run is stopped before the command finished.
const STOPPED_MESSAGE: &str = "Run was stopped before completion.";

/// Errors that prevent a run from starting at all. Failures after the
/// command launches are reported through the run outcome instead.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What one run produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub run_start: chrono::DateTime<Utc>,
    pub run_end: chrono::DateTime<Utc>,
    pub cancelled: bool,
}

/// Executes jobs against a store.
pub struct JobRunner {
    store: Arc<dyn JobStore>,
    registry: CommandRegistry,
    notifier: Arc<dyn Notifier>,
    error_callback: Option<Arc<dyn ErrorCallback>>,
    hostname: String,
    heartbeat_enabled: bool,
    heartbeat_interval: Duration,
}

impl JobRunner {
    pub fn new(store: Arc<dyn JobStore>, hostname: impl Into<String>) -> Self {
        Self {
            store,
            registry: CommandRegistry::new(),
            notifier: Arc::new(LogNotifier),
            error_callback: None,
            hostname: hostname.into(),
            heartbeat_enabled: true,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }

    pub fn with_registry(mut self, registry: CommandRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_error_callback(mut self, callback: Arc<dyn ErrorCallback>) -> Self {
        self.error_callback = Some(callback);
        self
    }

    /// Disable the heartbeat task, for callers that manage liveness
    /// themselves.
    pub fn without_heartbeat(mut self) -> Self {
        self.heartbeat_enabled = false;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Run one job to completion.
    ///
    /// `forced` runs skip the schedule advance so the job's regular slot
    /// stays in place. The outcome is returned even for failed runs; an
    /// error means the run could not be claimed.
    pub async fn execute(&self, job_id: JobId, forced: bool) -> Result<RunOutcome, RunnerError> {
        let job = self.store.get_job(job_id).await?;
        let origin_pid = std::process::id();
        let run_start = Utc::now();

        self.store
            .mark_running(job_id, &self.hostname, origin_pid, run_start)
            .await?;
        info!(job_id = %job_id, name = %job.name, forced, "run started");

        let cancel = CancellationToken::new();
        let guard = Arc::new(Mutex::new(()));
        let heartbeat = if self.heartbeat_enabled {
            Some(
                HeartbeatMonitor::new(
                    self.store.clone(),
                    job_id,
                    guard.clone(),
                    cancel.clone(),
                )
                .with_interval(self.heartbeat_interval)
                .start(),
            )
        } else {
            None
        };

        let (stdout, mut stderr, cancelled) =
            self.run_command(&job, &cancel, guard.clone()).await;

        if let Some(heartbeat) = heartbeat {
            heartbeat.stop().await;
        }
        let run_end = Utc::now();

        // Advance the schedule from whichever is later, the missed slot or
        // the end of this run, so the next occurrence is in the future.
        let next_run = if forced {
            None
        } else {
            match job.recurrence_rule() {
                Ok(rule) => {
                    // anchor at the old slot to keep the phase; advance past
                    // whichever is later, the missed slot or this run's end
                    let anchor = job.next_run.unwrap_or(run_end);
                    match rule.next_after(anchor, anchor.max(run_end)) {
                        Ok(next) => Some(next),
                        Err(e) => {
                            stderr.push_str(&format!("failed to compute next run: {e}\n"));
                            None
                        }
                    }
                }
                Err(e) => {
                    stderr.push_str(&format!("invalid schedule: {e}\n"));
                    None
                }
            }
        };

        let success = stderr.is_empty();

        // A forked child must never write the parent's bookkeeping.
        if std::process::id() != origin_pid {
            return Ok(RunOutcome {
                success,
                stdout,
                stderr,
                run_start,
                run_end,
                cancelled,
            });
        }

        let completion = RunCompletion {
            run_start,
            run_end,
            success,
            next_run,
        };
        let mut completion_ok = true;
        if let Err(e) = self.store.complete_run(job_id, &completion).await {
            error!(job_id = %job_id, error = %e, "failed to record run completion");
            completion_ok = false;
        }

        let entry = LogEntry::new(
            job_id,
            run_start,
            run_end,
            if job.log_stdout {
                stdout.clone()
            } else {
                String::new()
            },
            if job.log_stderr {
                stderr.clone()
            } else {
                String::new()
            },
            success,
            true,
            self.hostname.clone(),
        );
        if let Err(e) = self.store.append_log(entry.clone()).await {
            warn!(job_id = %job_id, error = %e, "failed to append run log");
        }

        self.notify(&job, &entry).await;

        if !success {
            if let Some(callback) = &self.error_callback {
                if let Err(e) = callback.on_error(&job, &entry).await {
                    warn!(job_id = %job_id, error = %e, "error callback failed");
                }
            }
        }

        // Completion failed to land; at minimum release the running claim
        // so the job is not stuck until the reaper finds it.
        if !completion_ok {
            if let Err(e) = self.store.clear_running(job_id).await {
                error!(job_id = %job_id, error = %e, "failed to release running claim");
            }
        }

        info!(
            job_id = %job_id,
            name = %job.name,
            success,
            duration_seconds = entry.duration_seconds,
            "run finished"
        );
        Ok(RunOutcome {
            success,
            stdout,
            stderr,
            run_start,
            run_end,
            cancelled,
        })
    }

    /// Run the job's command, returning captured stdout, stderr, and
    /// whether the run was cancelled mid-flight.
    async fn run_command(
        &self,
        job: &Job,
        cancel: &CancellationToken,
        guard: Arc<Mutex<()>>,
    ) -> (String, String, bool) {
        match &job.command {
            CommandSpec::Raw(line) => match run_raw(line, cancel).await {
                Ok(captured) => {
                    let mut stderr = captured.stderr;
                    if captured.cancelled {
                        stderr.push_str(STOPPED_MESSAGE);
                        stderr.push('\n');
                    } else if captured.exit_code != Some(0) {
                        match captured.exit_code {
                            Some(code) => stderr
                                .push_str(&format!("command exited with non-zero status {code}\n")),
                            None => stderr.push_str("command terminated by signal\n"),
                        }
                    }
                    (captured.stdout, stderr, captured.cancelled)
                }
                Err(e) => (String::new(), format!("{e}\n"), false),
            },
            CommandSpec::Structured { name, raw_args } => {
                let Some(handler) = self.registry.get(name) else {
                    return (String::new(), format!("unknown command: {name}\n"), false);
                };
                let progress = ProgressRecorder::new(self.store.clone(), job.id, guard);
                let mut ctx = CommandContext::new(Some(progress));
                let (args, options) = parse_args(raw_args);
                let cancelled = tokio::select! {
                    result = handler.run(&mut ctx, &args, &options) => {
                        if let Err(e) = result {
                            ctx.write_stderr(&e.to_string());
                        }
                        false
                    }
                    _ = cancel.cancelled() => {
                        ctx.write_stderr(STOPPED_MESSAGE);
                        true
                    }
                };
                (ctx.stdout, ctx.stderr, cancelled)
            }
        }
    }

    async fn notify(&self, job: &Job, entry: &LogEntry) {
        let notification = if !entry.success && job.email_errors {
            Some(failure_notification(job, entry))
        } else if entry.success && job.email_success {
            Some(success_notification(job, entry))
        } else {
            None
        };
        let Some(notification) = notification else {
            return;
        };
        if notification.recipients.is_empty() {
            debug!(job_id = %job.id, "no subscribers, skipping notification");
            return;
        }
        if let Err(e) = self.notifier.send(&notification).await {
            warn!(job_id = %job.id, error = %e, "notification delivery failed");
        }
    }
}
