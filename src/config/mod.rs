//! Declarative job configuration.
//!
//! Jobs and their dependency edges can be described in a YAML file and
//! synced into the store. The file is the source of truth for definitions
//! it names; run-state and jobs created elsewhere are left untouched.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::core::dependency::JobDependency;
use crate::core::job::{CommandSpec, Job, JobKind};
use crate::core::recurrence::{
    translate_human_schedule, Frequency, HumanSchedule, RecurrenceError,
};
use crate::core::types::JobId;
use crate::store::{JobStore, StoreError};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("job definition has no name")]
    EmptyName,

    #[error("duplicate job name: {0}")]
    DuplicateName(String),

    #[error("job {0}: exactly one of `command` or `raw_command` is required")]
    AmbiguousCommand(String),

    #[error("job {0}: exactly one of `frequency` or `schedule` is required")]
    AmbiguousSchedule(String),

    #[error("job {job}: {source}")]
    Recurrence {
        job: String,
        source: RecurrenceError,
    },

    #[error("job {job}: unknown dependency {dependee}")]
    UnknownDependency { job: String, dependee: String },

    #[error("job {0} depends on itself")]
    SelfDependency(String),

    #[error("dependency cycle involving job {0}")]
    DependencyCycle(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Top-level config file shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleFile {
    pub jobs: Vec<JobDefinition>,
}

/// One job as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobDefinition {
    pub name: String,

    /// Named handler to dispatch through the command registry.
    #[serde(default)]
    pub command: Option<String>,
    /// Argument string for a named handler.
    #[serde(default)]
    pub args: String,
    /// Shell command line, mutually exclusive with `command`.
    #[serde(default)]
    pub raw_command: Option<String>,

    #[serde(default)]
    pub monitor: Option<MonitorDefinition>,

    /// Frequency name, YEARLY through SECONDLY (case-insensitive).
    #[serde(default)]
    pub frequency: Option<String>,
    #[serde(default)]
    pub params: String,
    /// Human-friendly alternative to frequency + params.
    #[serde(default)]
    pub schedule: Option<HumanSchedule>,
    #[serde(default = "default_timezone")]
    pub timezone: String,

    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub timeout_seconds: u32,
    #[serde(default)]
    pub target_hostname: Option<String>,

    #[serde(default)]
    pub subscribers: Vec<String>,
    #[serde(default = "default_true")]
    pub email_errors: bool,
    #[serde(default)]
    pub email_success: bool,

    #[serde(default = "default_log_entries")]
    pub maximum_log_entries: u32,
    #[serde(default = "default_true")]
    pub log_stdout: bool,
    #[serde(default = "default_true")]
    pub log_stderr: bool,

    #[serde(default)]
    pub dependencies: Vec<DependencyDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonitorDefinition {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub error_template: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DependencyDefinition {
    /// Name of the dependee job.
    pub job: String,
    #[serde(default = "default_true")]
    pub wait_for_completion: bool,
    #[serde(default)]
    pub wait_for_success: bool,
    #[serde(default)]
    pub wait_for_next_run: bool,
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

/// A definition resolved to concrete rule terms.
struct ResolvedSchedule {
    frequency: Frequency,
    params: String,
    next_run: Option<DateTime<Utc>>,
}

impl ScheduleFile {
    /// Load and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Parse and validate config text.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let file: ScheduleFile = serde_yaml::from_str(text)?;
        file.validate(Utc::now())?;
        Ok(file)
    }

    /// Check the whole file: names, command shapes, schedules, and the
    /// dependency graph.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), ConfigError> {
        let mut names: HashSet<&str> = HashSet::new();
        for def in &self.jobs {
            if def.name.trim().is_empty() {
                return Err(ConfigError::EmptyName);
            }
            if !names.insert(def.name.as_str()) {
                return Err(ConfigError::DuplicateName(def.name.clone()));
            }
            def.command_spec()?;
            let resolved = def.resolve_schedule(now)?;
            // parsing the rule validates params and timezone together
            def.parse_rule(&resolved)?;

            for dep in &def.dependencies {
                if dep.job == def.name {
                    return Err(ConfigError::SelfDependency(def.name.clone()));
                }
                if !self.jobs.iter().any(|j| j.name == dep.job) {
                    return Err(ConfigError::UnknownDependency {
                        job: def.name.clone(),
                        dependee: dep.job.clone(),
                    });
                }
            }
        }
        self.check_cycles()
    }

    /// Kahn's algorithm over the declared edges; any leftover node is part
    /// of a cycle.
    fn check_cycles(&self) -> Result<(), ConfigError> {
        let mut in_degree: HashMap<&str, usize> =
            self.jobs.iter().map(|j| (j.name.as_str(), 0)).collect();
        let mut downstream: HashMap<&str, Vec<&str>> = HashMap::new();
        for def in &self.jobs {
            for dep in &def.dependencies {
                *in_degree.entry(def.name.as_str()).or_default() += 1;
                downstream
                    .entry(dep.job.as_str())
                    .or_default()
                    .push(def.name.as_str());
            }
        }
        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();
        let mut visited = 0;
        while let Some(name) = queue.pop_front() {
            visited += 1;
            for next in downstream.get(name).into_iter().flatten() {
                let d = in_degree.get_mut(next).ok_or_else(|| {
                    ConfigError::UnknownDependency {
                        job: (*next).to_string(),
                        dependee: name.to_string(),
                    }
                })?;
                *d -= 1;
                if *d == 0 {
                    queue.push_back(next);
                }
            }
        }
        if visited != self.jobs.len() {
            let stuck = in_degree
                .iter()
                .filter(|(_, d)| **d > 0)
                .map(|(n, _)| *n)
                .min()
                .unwrap_or("");
            return Err(ConfigError::DependencyCycle(stuck.to_string()));
        }
        Ok(())
    }

    /// Apply the file to a store: create missing jobs, update existing ones,
    /// and rebuild the dependency edges of every job the file names.
    pub async fn sync_to_store(
        &self,
        store: &dyn JobStore,
        now: DateTime<Utc>,
    ) -> Result<SyncReport, ConfigError> {
        self.validate(now)?;

        let mut report = SyncReport::default();
        let mut ids: HashMap<&str, JobId> = HashMap::new();

        for def in &self.jobs {
            let resolved = def.resolve_schedule(now)?;
            let id = match store.find_job_by_name(&def.name).await? {
                None => {
                    let mut job = def.build_job(&resolved)?;
                    job.refresh_next_run(now, false)
                        .map_err(|source| ConfigError::Recurrence {
                            job: def.name.clone(),
                            source,
                        })?;
                    let id = store.create_job(job).await?;
                    info!(job_id = %id, name = %def.name, "job created from config");
                    report.created += 1;
                    id
                }
                Some(mut existing) => {
                    let schedule_changed = existing.frequency != resolved.frequency
                        || existing.params != resolved.params
                        || existing.timezone != def.timezone;
                    def.apply_to(&mut existing, &resolved)?;
                    if schedule_changed {
                        existing
                            .refresh_next_run(now, true)
                            .map_err(|source| ConfigError::Recurrence {
                                job: def.name.clone(),
                                source,
                            })?;
                    }
                    store.save_job(&existing).await?;
                    info!(job_id = %existing.id, name = %def.name, "job updated from config");
                    report.updated += 1;
                    existing.id
                }
            };
            ids.insert(def.name.as_str(), id);
        }

        for def in &self.jobs {
            let dependent = ids[def.name.as_str()];
            store.clear_dependencies_of(dependent).await?;
            for dep in &def.dependencies {
                let mut edge = JobDependency::new(dependent, ids[dep.job.as_str()]);
                edge.wait_for_completion = dep.wait_for_completion;
                edge.wait_for_success = dep.wait_for_success;
                edge.wait_for_next_run = dep.wait_for_next_run;
                store.add_dependency(edge).await?;
            }
        }
        Ok(report)
    }
}

/// What a sync changed.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub created: usize,
    pub updated: usize,
}

impl JobDefinition {
    fn command_spec(&self) -> Result<CommandSpec, ConfigError> {
        match (&self.command, &self.raw_command) {
            (Some(name), None) => Ok(CommandSpec::Structured {
                name: name.clone(),
                raw_args: self.args.clone(),
            }),
            (None, Some(line)) => Ok(CommandSpec::Raw(line.clone())),
            _ => Err(ConfigError::AmbiguousCommand(self.name.clone())),
        }
    }

    fn resolve_schedule(&self, now: DateTime<Utc>) -> Result<ResolvedSchedule, ConfigError> {
        match (&self.frequency, &self.schedule) {
            (Some(name), None) => {
                let frequency =
                    name.parse()
                        .map_err(|source| ConfigError::Recurrence {
                            job: self.name.clone(),
                            source,
                        })?;
                Ok(ResolvedSchedule {
                    frequency,
                    params: self.params.clone(),
                    next_run: None,
                })
            }
            (None, Some(schedule)) => {
                let translated = translate_human_schedule(schedule, now).map_err(|source| {
                    ConfigError::Recurrence {
                        job: self.name.clone(),
                        source,
                    }
                })?;
                Ok(ResolvedSchedule {
                    frequency: translated.frequency,
                    params: translated.params,
                    next_run: translated.next_run,
                })
            }
            _ => Err(ConfigError::AmbiguousSchedule(self.name.clone())),
        }
    }

    fn parse_rule(&self, resolved: &ResolvedSchedule) -> Result<(), ConfigError> {
        let tz = self
            .timezone
            .parse()
            .map_err(|_| ConfigError::Recurrence {
                job: self.name.clone(),
                source: RecurrenceError::UnknownTimezone(self.timezone.clone()),
            })?;
        crate::core::recurrence::RecurrenceRule::parse(resolved.frequency, &resolved.params, tz)
            .map_err(|source| ConfigError::Recurrence {
                job: self.name.clone(),
                source,
            })?;
        Ok(())
    }

    fn kind(&self) -> JobKind {
        match &self.monitor {
            Some(m) => JobKind::Monitor {
                url: m.url.clone(),
                error_template: m.error_template.clone(),
                description: m.description.clone(),
            },
            None => JobKind::Recurring,
        }
    }

    fn build_job(&self, resolved: &ResolvedSchedule) -> Result<Job, ConfigError> {
        let mut job = Job::builder(&self.name, self.command_spec()?, resolved.frequency)
            .params(&resolved.params)
            .timezone(&self.timezone)
            .enabled(self.enabled)
            .timeout_seconds(self.timeout_seconds)
            .subscribers(self.subscribers.clone())
            .maximum_log_entries(self.maximum_log_entries)
            .build();
        self.finish(&mut job, resolved);
        Ok(job)
    }

    /// Overwrite an existing job's definition fields, preserving run-state.
    fn apply_to(&self, job: &mut Job, resolved: &ResolvedSchedule) -> Result<(), ConfigError> {
        job.command = self.command_spec()?;
        job.frequency = resolved.frequency;
        job.params = resolved.params.clone();
        job.timezone = self.timezone.clone();
        job.enabled = self.enabled;
        job.timeout_seconds = self.timeout_seconds;
        job.subscribers = self.subscribers.clone();
        job.maximum_log_entries = self.maximum_log_entries;
        self.finish(job, resolved);
        Ok(())
    }

    fn finish(&self, job: &mut Job, resolved: &ResolvedSchedule) {
        job.kind = self.kind();
        job.target_hostname = self.target_hostname.clone();
        job.email_errors = self.email_errors;
        job.email_success = self.email_success;
        job.log_stdout = self.log_stdout;
        job.log_stderr = self.log_stderr;
        if let Some(next_run) = resolved.next_run {
            job.next_run = Some(next_run);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    const BASIC: &str = "
jobs:
  - name: backup
    raw_command: pg_dump mydb
    frequency: daily
    params: 'byhour:3;byminute:30'
    subscribers: [ops@example.com]
  - name: report
    command: send_report
    args: 'format=pdf weekly'
    frequency: weekly
    params: 'byweekday:MO'
    dependencies:
      - job: backup
        wait_for_success: true
";

    #[test]
    fn test_parse_basic_file() {
        let file = ScheduleFile::parse(BASIC).unwrap();
        assert_eq!(file.jobs.len(), 2);
        assert_eq!(
            file.jobs[0].command_spec().unwrap(),
            CommandSpec::Raw("pg_dump mydb".into())
        );
        assert_eq!(file.jobs[1].dependencies[0].job, "backup");
        assert!(file.jobs[1].dependencies[0].wait_for_success);
        assert!(file.jobs[1].dependencies[0].wait_for_completion);
    }

    #[test]
    fn test_both_command_shapes_rejected() {
        let text = "
jobs:
  - name: bad
    command: thing
    raw_command: thing.sh
    frequency: daily
";
        assert!(matches!(
            ScheduleFile::parse(text),
            Err(ConfigError::AmbiguousCommand(name)) if name == "bad"
        ));
    }

    #[test]
    fn test_missing_command_rejected() {
        let text = "
jobs:
  - name: bad
    frequency: daily
";
        assert!(matches!(
            ScheduleFile::parse(text),
            Err(ConfigError::AmbiguousCommand(_))
        ));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let text = "
jobs:
  - name: solo
    raw_command: 'true'
    frequency: daily
    dependencies:
      - job: ghost
";
        assert!(matches!(
            ScheduleFile::parse(text),
            Err(ConfigError::UnknownDependency { dependee, .. }) if dependee == "ghost"
        ));
    }

    #[test]
    fn test_self_dependency_rejected() {
        let text = "
jobs:
  - name: loopy
    raw_command: 'true'
    frequency: daily
    dependencies:
      - job: loopy
";
        assert!(matches!(
            ScheduleFile::parse(text),
            Err(ConfigError::SelfDependency(_))
        ));
    }

    #[test]
    fn test_dependency_cycle_rejected() {
        let text = "
jobs:
  - name: a
    raw_command: 'true'
    frequency: daily
    dependencies: [{job: b}]
  - name: b
    raw_command: 'true'
    frequency: daily
    dependencies: [{job: a}]
";
        assert!(matches!(
            ScheduleFile::parse(text),
            Err(ConfigError::DependencyCycle(_))
        ));
    }

    #[test]
    fn test_bad_params_rejected_with_job_name() {
        let text = "
jobs:
  - name: typo
    raw_command: 'true'
    frequency: daily
    params: 'bywat:1'
";
        assert!(matches!(
            ScheduleFile::parse(text),
            Err(ConfigError::Recurrence { job, .. }) if job == "typo"
        ));
    }

    #[test]
    fn test_human_schedule_resolves() {
        let text = "
jobs:
  - name: sweeper
    raw_command: sweep.sh
    schedule:
      every_minutes: 15
";
        let file = ScheduleFile::parse(text).unwrap();
        let resolved = file.jobs[0].resolve_schedule(Utc::now()).unwrap();
        assert_eq!(resolved.frequency, Frequency::Minutely);
        assert_eq!(resolved.params, "interval:15");
        assert!(resolved.next_run.is_some());
    }

    #[test]
    fn test_frequency_and_schedule_together_rejected() {
        let text = "
jobs:
  - name: confused
    raw_command: 'true'
    frequency: daily
    schedule:
      every_minutes: 5
";
        assert!(matches!(
            ScheduleFile::parse(text),
            Err(ConfigError::AmbiguousSchedule(_))
        ));
    }

    #[tokio::test]
    async fn test_sync_creates_then_updates() {
        let store = InMemoryStore::new();
        let file = ScheduleFile::parse(BASIC).unwrap();
        let now = Utc::now();

        let report = file.sync_to_store(&store, now).await.unwrap();
        assert_eq!(report, SyncReport { created: 2, updated: 0 });

        let backup = store.find_job_by_name("backup").await.unwrap().unwrap();
        assert!(backup.next_run.is_some());
        let edges = store.list_dependencies().await.unwrap();
        assert_eq!(edges.len(), 1);
        assert!(edges[0].wait_for_success);

        // second sync updates in place and rebuilds edges
        let report = file.sync_to_store(&store, now).await.unwrap();
        assert_eq!(report, SyncReport { created: 0, updated: 2 });
        assert_eq!(store.list_dependencies().await.unwrap().len(), 1);
        assert_eq!(store.list_jobs().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_sync_refreshes_schedule_on_change() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let file = ScheduleFile::parse(BASIC).unwrap();
        file.sync_to_store(&store, now).await.unwrap();
        let before = store
            .find_job_by_name("backup")
            .await
            .unwrap()
            .unwrap()
            .next_run;

        let mut changed = file.clone();
        changed.jobs[0].params = "byhour:9;byminute:0".to_string();
        changed.sync_to_store(&store, now).await.unwrap();
        let after = store.find_job_by_name("backup").await.unwrap().unwrap();
        assert_eq!(after.params, "byhour:9;byminute:0");
        assert_ne!(after.next_run, before);
    }
}
