//! Job definition: what to run, how often, and where.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::recurrence::{Frequency, RecurrenceError, RecurrenceRule};
use crate::core::types::JobId;

/// What a job executes. The two shapes are mutually exclusive by
/// construction; the config layer rejects definitions that specify both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "spec", rename_all = "snake_case")]
pub enum CommandSpec {
    /// A named command dispatched through the handler registry.
    /// `raw_args` is shell-split; `key=value` tokens become options and
    /// bare tokens become positional arguments.
    Structured {
        name: String,
        #[serde(default)]
        raw_args: String,
    },
    /// A shell command line executed verbatim via `sh -c`.
    Raw(String),
}

impl CommandSpec {
    /// Short human-readable rendering for listings and logs.
    pub fn describe(&self) -> String {
        match self {
            CommandSpec::Structured { name, raw_args } if raw_args.is_empty() => name.clone(),
            CommandSpec::Structured { name, raw_args } => format!("{} {}", name, raw_args),
            CommandSpec::Raw(line) => line.clone(),
        }
    }
}

/// Job flavor. Monitors schedule and execute exactly like recurring jobs;
/// only failure notifications render differently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobKind {
    Recurring,
    Monitor {
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        error_template: Option<String>,
        #[serde(default)]
        description: Option<String>,
    },
}

impl JobKind {
    /// Whether this job is a monitor check.
    pub fn is_monitor(&self) -> bool {
        matches!(self, JobKind::Monitor { .. })
    }
}

impl Default for JobKind {
    fn default() -> Self {
        JobKind::Recurring
    }
}

/// A recurring job and its full run-state.
///
/// Scheduling state (`next_run`, `is_running`, heartbeat and force flags)
/// lives on the job itself so that a single row describes both the
/// definition and the current health of the job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub command: CommandSpec,
    #[serde(default)]
    pub kind: JobKind,
    pub frequency: Frequency,
    /// Rule parameters, `key:value[,v...]` items joined by `;`.
    #[serde(default)]
    pub params: String,
    /// Timezone the rule's `by*` filters are evaluated in.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_true")]
    pub enabled: bool,

    pub next_run: Option<DateTime<Utc>>,
    pub last_run_start: Option<DateTime<Utc>>,
    pub last_run_end: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_running: bool,
    pub last_run_successful: Option<bool>,
    #[serde(default)]
    pub force_run: bool,
    #[serde(default)]
    pub force_stop: bool,

    /// Hard run-time limit in seconds; 0 means unlimited.
    #[serde(default)]
    pub timeout_seconds: u32,
    /// When set, only a scheduler on this host may run the job.
    pub target_hostname: Option<String>,
    pub current_hostname: Option<String>,
    pub current_pid: Option<u32>,

    #[serde(default)]
    pub total_parts: u32,
    #[serde(default)]
    pub total_parts_complete: u32,

    /// Log retention limit; 0 keeps every entry.
    #[serde(default = "default_log_entries")]
    pub maximum_log_entries: u32,
    #[serde(default = "default_true")]
    pub log_stdout: bool,
    #[serde(default = "default_true")]
    pub log_stderr: bool,

    #[serde(default)]
    pub subscribers: Vec<String>,
    #[serde(default = "default_true")]
    pub email_errors: bool,
    #[serde(default)]
    pub email_success: bool,
}

fn default_true() -> bool {
    true
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_log_entries() -> u32 {
    1000
}

impl Job {
    /// Start building a job with the required fields.
    pub fn builder(
        name: impl Into<String>,
        command: CommandSpec,
        frequency: Frequency,
    ) -> JobBuilder {
        JobBuilder::new(name, command, frequency)
    }

    /// Parse this job's recurrence rule.
    pub fn recurrence_rule(&self) -> Result<RecurrenceRule, RecurrenceError> {
        let tz = self
            .timezone
            .parse()
            .map_err(|_| RecurrenceError::UnknownTimezone(self.timezone.clone()))?;
        RecurrenceRule::parse(self.frequency, &self.params, tz)
    }

    /// Whether this job should run now on the given host.
    ///
    /// Due means: enabled, not already running, hostname pinning honored
    /// (unset or exact match), and either the scheduled time has arrived or
    /// a run was forced.
    pub fn is_due(&self, now: DateTime<Utc>, hostname: &str) -> bool {
        if !self.enabled || self.is_running {
            return false;
        }
        if !self.runs_on_host(hostname) {
            return false;
        }
        self.force_run || self.next_run.map(|t| t <= now).unwrap_or(false)
    }

    /// Hostname pinning: an unset or empty pin matches every host.
    pub fn runs_on_host(&self, hostname: &str) -> bool {
        match self.target_hostname.as_deref() {
            None | Some("") => true,
            Some(pinned) => pinned == hostname,
        }
    }

    /// Recompute `next_run` from the rule when the job is enabled and the
    /// slot is unset. `force` recomputes even when a value is present
    /// (used after a frequency or params change).
    pub fn refresh_next_run(
        &mut self,
        now: DateTime<Utc>,
        force: bool,
    ) -> Result<(), RecurrenceError> {
        if !self.enabled {
            return Ok(());
        }
        if self.next_run.is_some() && !force {
            return Ok(());
        }
        let rule = self.recurrence_rule()?;
        self.next_run = Some(rule.next_after(now, now)?);
        Ok(())
    }

    /// Progress through the current run, 0..=100, when parts are reported.
    pub fn progress_percent(&self) -> Option<u32> {
        if self.total_parts == 0 {
            return None;
        }
        Some((self.total_parts_complete * 100 / self.total_parts).min(100))
    }

    /// Liveness timestamp used by the stale reaper: the last heartbeat,
    /// falling back to the run start for runs without a heartbeat thread.
    pub fn liveness_timestamp(&self) -> Option<DateTime<Utc>> {
        self.last_heartbeat.or(self.last_run_start)
    }
}

/// Builder for [`Job`].
pub struct JobBuilder {
    job: Job,
}

impl JobBuilder {
    fn new(name: impl Into<String>, command: CommandSpec, frequency: Frequency) -> Self {
        Self {
            job: Job {
                id: JobId::new(0),
                name: name.into(),
                command,
                kind: JobKind::Recurring,
                frequency,
                params: String::new(),
                timezone: default_timezone(),
                enabled: true,
                next_run: None,
                last_run_start: None,
                last_run_end: None,
                last_heartbeat: None,
                is_running: false,
                last_run_successful: None,
                force_run: false,
                force_stop: false,
                timeout_seconds: 0,
                target_hostname: None,
                current_hostname: None,
                current_pid: None,
                total_parts: 0,
                total_parts_complete: 0,
                maximum_log_entries: default_log_entries(),
                log_stdout: true,
                log_stderr: true,
                subscribers: Vec::new(),
                email_errors: true,
                email_success: false,
            },
        }
    }

    /// Set the rule parameter string.
    pub fn params(mut self, params: impl Into<String>) -> Self {
        self.job.params = params.into();
        self
    }

    /// Set the rule timezone.
    pub fn timezone(mut self, tz: impl Into<String>) -> Self {
        self.job.timezone = tz.into();
        self
    }

    /// Enable or disable the job.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.job.enabled = enabled;
        self
    }

    /// Set the run-time limit in seconds (0 = unlimited).
    pub fn timeout_seconds(mut self, secs: u32) -> Self {
        self.job.timeout_seconds = secs;
        self
    }

    /// Pin the job to a host.
    pub fn target_hostname(mut self, host: impl Into<String>) -> Self {
        self.job.target_hostname = Some(host.into());
        self
    }

    /// Set the first scheduled occurrence.
    pub fn next_run(mut self, at: DateTime<Utc>) -> Self {
        self.job.next_run = Some(at);
        self
    }

    /// Mark the job as a monitor check.
    pub fn monitor(
        mut self,
        url: Option<String>,
        error_template: Option<String>,
        description: Option<String>,
    ) -> Self {
        self.job.kind = JobKind::Monitor {
            url,
            error_template,
            description,
        };
        self
    }

    /// Set notification subscribers.
    pub fn subscribers(mut self, subscribers: Vec<String>) -> Self {
        self.job.subscribers = subscribers;
        self
    }

    /// Set the log retention limit.
    pub fn maximum_log_entries(mut self, max: u32) -> Self {
        self.job.maximum_log_entries = max;
        self
    }

    /// Finish building.
    pub fn build(self) -> Job {
        self.job
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn echo_job() -> Job {
        Job::builder(
            "echo",
            CommandSpec::Raw("echo hello".into()),
            Frequency::Daily,
        )
        .build()
    }

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, 0, 0).unwrap()
    }

    #[test]
    fn test_not_due_without_next_run() {
        let job = echo_job();
        assert!(!job.is_due(at(12), "host-a"));
    }

    #[test]
    fn test_due_when_next_run_passed() {
        let mut job = echo_job();
        job.next_run = Some(at(10));
        assert!(job.is_due(at(12), "host-a"));
        assert!(!job.is_due(at(9), "host-a"));
    }

    #[test]
    fn test_force_run_overrides_schedule() {
        let mut job = echo_job();
        job.force_run = true;
        assert!(job.is_due(at(12), "host-a"));
    }

    #[test]
    fn test_running_job_is_not_due() {
        let mut job = echo_job();
        job.next_run = Some(at(10));
        job.is_running = true;
        assert!(!job.is_due(at(12), "host-a"));
    }

    #[test]
    fn test_disabled_job_is_not_due() {
        let mut job = echo_job();
        job.next_run = Some(at(10));
        job.enabled = false;
        assert!(!job.is_due(at(12), "host-a"));
    }

    #[test]
    fn test_hostname_pinning() {
        let mut job = echo_job();
        job.next_run = Some(at(10));
        job.target_hostname = Some("host-b".into());
        assert!(!job.is_due(at(12), "host-a"));
        assert!(job.is_due(at(12), "host-b"));

        job.target_hostname = Some(String::new());
        assert!(job.is_due(at(12), "anything"));
    }

    #[test]
    fn test_refresh_next_run_sets_unset_slot() {
        let mut job = echo_job();
        job.refresh_next_run(at(10), false).unwrap();
        let first = job.next_run.unwrap();
        assert!(first > at(10));

        // a second non-forced refresh leaves the slot alone
        job.refresh_next_run(at(12), false).unwrap();
        assert_eq!(job.next_run, Some(first));
    }

    #[test]
    fn test_refresh_next_run_skips_disabled() {
        let mut job = echo_job();
        job.enabled = false;
        job.refresh_next_run(at(10), false).unwrap();
        assert_eq!(job.next_run, None);
    }

    #[test]
    fn test_progress_percent() {
        let mut job = echo_job();
        assert_eq!(job.progress_percent(), None);
        job.total_parts = 4;
        job.total_parts_complete = 1;
        assert_eq!(job.progress_percent(), Some(25));
        job.total_parts_complete = 9;
        assert_eq!(job.progress_percent(), Some(100));
    }

    #[test]
    fn test_bad_params_surface_as_rule_error() {
        let mut job = echo_job();
        job.params = "bywat:1".into();
        assert!(job.recurrence_rule().is_err());
    }

    #[test]
    fn test_monitor_kind() {
        let job = Job::builder(
            "site-check",
            CommandSpec::Raw("curl -fsS https://example.com".into()),
            Frequency::Minutely,
        )
        .monitor(Some("https://example.com".into()), None, None)
        .build();
        assert!(job.kind.is_monitor());
        assert!(!echo_job().kind.is_monitor());
    }

    #[test]
    fn test_liveness_prefers_heartbeat() {
        let mut job = echo_job();
        assert_eq!(job.liveness_timestamp(), None);
        job.last_run_start = Some(at(8));
        assert_eq!(job.liveness_timestamp(), Some(at(8)));
        job.last_heartbeat = Some(at(9));
        assert_eq!(job.liveness_timestamp(), Some(at(9)));
    }
}
