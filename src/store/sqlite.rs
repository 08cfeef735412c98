//! SQLite storage implementation.
//!
//! Persistent backend shared between the scheduler and its worker
//! subprocesses. Timestamps are stored as microseconds since the epoch so
//! range comparisons happen in SQL.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

use super::{HeartbeatTick, JobStore, LogEntry, RunCompletion, StoreError};
use crate::core::dependency::JobDependency;
use crate::core::job::{CommandSpec, Job, JobKind};
use crate::core::types::{JobId, LogId};

const JOB_COLUMNS: &str = "id, name, command_kind, command_name, command_args, raw_command, \
     kind, monitor_url, monitor_error_template, monitor_description, \
     frequency, params, timezone, enabled, \
     next_run, last_run_start, last_run_end, last_heartbeat, \
     is_running, last_run_successful, force_run, force_stop, \
     timeout_seconds, target_hostname, current_hostname, current_pid, \
     total_parts, total_parts_complete, maximum_log_entries, \
     log_stdout, log_stderr, subscribers, email_errors, email_success";

/// SQLite storage backend.
pub struct SqliteStore {
    pool: SqlitePool,
    /// Wrap the due scan in an immediate transaction so two schedulers
    /// pointed at the same database don't double-dispatch.
    exclusive_due_scan: bool,
}

impl SqliteStore {
    /// Open (creating if missing) a database file and apply the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path_str = path.as_ref().to_string_lossy();
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path_str))
            .map_err(|e| StoreError::Backend(e.to_string()))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let store = Self {
            pool,
            exclusive_due_scan: false,
        };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Create an in-memory database (useful for testing).
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let store = Self {
            pool,
            exclusive_due_scan: false,
        };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Enable the exclusive due scan (see the field doc).
    pub fn with_exclusive_due_scan(mut self) -> Self {
        self.exclusive_due_scan = true;
        self
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        let schema = include_str!("../../migrations/001_initial_schema.sql");
        sqlx::raw_sql(schema)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("migration failed: {}", e)))?;
        Ok(())
    }

    /// Close the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn prune_logs(&self, id: JobId, keep: i64) -> Result<(), StoreError> {
        // 0 means keep everything
        if keep == 0 {
            return Ok(());
        }
        sqlx::query(
            "DELETE FROM logs WHERE job_id = ? AND id NOT IN \
             (SELECT id FROM logs WHERE job_id = ? ORDER BY run_start DESC LIMIT ?)",
        )
        .bind(id.as_i64())
        .bind(id.as_i64())
        .bind(keep)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }
}

// Timestamp helpers: microseconds since epoch, nullable.
fn to_micros(time: Option<DateTime<Utc>>) -> Option<i64> {
    time.map(|t| t.timestamp_micros())
}

fn from_micros(micros: Option<i64>) -> Option<DateTime<Utc>> {
    micros.and_then(DateTime::from_timestamp_micros)
}

fn command_columns(command: &CommandSpec) -> (&'static str, Option<&str>, Option<&str>, Option<&str>) {
    match command {
        CommandSpec::Structured { name, raw_args } => {
            ("structured", Some(name.as_str()), Some(raw_args.as_str()), None)
        }
        CommandSpec::Raw(line) => ("raw", None, None, Some(line.as_str())),
    }
}

fn kind_columns(kind: &JobKind) -> (&'static str, Option<&str>, Option<&str>, Option<&str>) {
    match kind {
        JobKind::Recurring => ("recurring", None, None, None),
        JobKind::Monitor {
            url,
            error_template,
            description,
        } => (
            "monitor",
            url.as_deref(),
            error_template.as_deref(),
            description.as_deref(),
        ),
    }
}

fn row_to_job(row: &SqliteRow) -> Result<Job, StoreError> {
    let get_err = |e: sqlx::Error| StoreError::Serialization(e.to_string());

    let command = match row.try_get::<String, _>("command_kind").map_err(get_err)?.as_str() {
        "structured" => CommandSpec::Structured {
            name: row
                .try_get::<Option<String>, _>("command_name")
                .map_err(get_err)?
                .unwrap_or_default(),
            raw_args: row
                .try_get::<Option<String>, _>("command_args")
                .map_err(get_err)?
                .unwrap_or_default(),
        },
        _ => CommandSpec::Raw(
            row.try_get::<Option<String>, _>("raw_command")
                .map_err(get_err)?
                .unwrap_or_default(),
        ),
    };

    let kind = match row.try_get::<String, _>("kind").map_err(get_err)?.as_str() {
        "monitor" => JobKind::Monitor {
            url: row.try_get("monitor_url").map_err(get_err)?,
            error_template: row.try_get("monitor_error_template").map_err(get_err)?,
            description: row.try_get("monitor_description").map_err(get_err)?,
        },
        _ => JobKind::Recurring,
    };

    let frequency_text: String = row.try_get("frequency").map_err(get_err)?;
    let frequency = frequency_text
        .parse()
        .map_err(|e| StoreError::Serialization(format!("{}", e)))?;

    let subscribers_json: String = row.try_get("subscribers").map_err(get_err)?;
    let subscribers: Vec<String> = serde_json::from_str(&subscribers_json)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;

    Ok(Job {
        id: JobId::new(row.try_get("id").map_err(get_err)?),
        name: row.try_get("name").map_err(get_err)?,
        command,
        kind,
        frequency,
        params: row.try_get("params").map_err(get_err)?,
        timezone: row.try_get("timezone").map_err(get_err)?,
        enabled: row.try_get("enabled").map_err(get_err)?,
        next_run: from_micros(row.try_get("next_run").map_err(get_err)?),
        last_run_start: from_micros(row.try_get("last_run_start").map_err(get_err)?),
        last_run_end: from_micros(row.try_get("last_run_end").map_err(get_err)?),
        last_heartbeat: from_micros(row.try_get("last_heartbeat").map_err(get_err)?),
        is_running: row.try_get("is_running").map_err(get_err)?,
        last_run_successful: row.try_get("last_run_successful").map_err(get_err)?,
        force_run: row.try_get("force_run").map_err(get_err)?,
        force_stop: row.try_get("force_stop").map_err(get_err)?,
        timeout_seconds: row.try_get::<i64, _>("timeout_seconds").map_err(get_err)? as u32,
        target_hostname: row.try_get("target_hostname").map_err(get_err)?,
        current_hostname: row.try_get("current_hostname").map_err(get_err)?,
        current_pid: row
            .try_get::<Option<i64>, _>("current_pid")
            .map_err(get_err)?
            .map(|p| p as u32),
        total_parts: row.try_get::<i64, _>("total_parts").map_err(get_err)? as u32,
        total_parts_complete: row
            .try_get::<i64, _>("total_parts_complete")
            .map_err(get_err)? as u32,
        maximum_log_entries: row
            .try_get::<i64, _>("maximum_log_entries")
            .map_err(get_err)? as u32,
        log_stdout: row.try_get("log_stdout").map_err(get_err)?,
        log_stderr: row.try_get("log_stderr").map_err(get_err)?,
        subscribers,
        email_errors: row.try_get("email_errors").map_err(get_err)?,
        email_success: row.try_get("email_success").map_err(get_err)?,
    })
}

type LogRow = (
    String,
    i64,
    i64,
    i64,
    i64,
    String,
    String,
    bool,
    bool,
    String,
);

fn row_to_log(row: LogRow) -> Result<LogEntry, StoreError> {
    let uuid = Uuid::parse_str(&row.0).map_err(|e| StoreError::Serialization(e.to_string()))?;
    let run_start = from_micros(Some(row.2))
        .ok_or_else(|| StoreError::Serialization("bad run_start".into()))?;
    let run_end =
        from_micros(Some(row.3)).ok_or_else(|| StoreError::Serialization("bad run_end".into()))?;
    Ok(LogEntry {
        id: LogId::from_uuid(uuid),
        job_id: JobId::new(row.1),
        run_start,
        run_end,
        duration_seconds: row.4,
        stdout: row.5,
        stderr: row.6,
        success: row.7,
        on_time: row.8,
        hostname: row.9,
    })
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn create_job(&self, job: Job) -> Result<JobId, StoreError> {
        let (command_kind, command_name, command_args, raw_command) =
            command_columns(&job.command);
        let (kind, monitor_url, monitor_error_template, monitor_description) =
            kind_columns(&job.kind);
        let subscribers = serde_json::to_string(&job.subscribers)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let result = sqlx::query(
            "INSERT INTO jobs (name, command_kind, command_name, command_args, raw_command, \
             kind, monitor_url, monitor_error_template, monitor_description, \
             frequency, params, timezone, enabled, \
             next_run, last_run_start, last_run_end, last_heartbeat, \
             is_running, last_run_successful, force_run, force_stop, \
             timeout_seconds, target_hostname, current_hostname, current_pid, \
             total_parts, total_parts_complete, maximum_log_entries, \
             log_stdout, log_stderr, subscribers, email_errors, email_success) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, \
             ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&job.name)
        .bind(command_kind)
        .bind(command_name)
        .bind(command_args)
        .bind(raw_command)
        .bind(kind)
        .bind(monitor_url)
        .bind(monitor_error_template)
        .bind(monitor_description)
        .bind(job.frequency.as_str())
        .bind(&job.params)
        .bind(&job.timezone)
        .bind(job.enabled)
        .bind(to_micros(job.next_run))
        .bind(to_micros(job.last_run_start))
        .bind(to_micros(job.last_run_end))
        .bind(to_micros(job.last_heartbeat))
        .bind(job.is_running)
        .bind(job.last_run_successful)
        .bind(job.force_run)
        .bind(job.force_stop)
        .bind(job.timeout_seconds as i64)
        .bind(&job.target_hostname)
        .bind(&job.current_hostname)
        .bind(job.current_pid.map(|p| p as i64))
        .bind(job.total_parts as i64)
        .bind(job.total_parts_complete as i64)
        .bind(job.maximum_log_entries as i64)
        .bind(job.log_stdout)
        .bind(job.log_stderr)
        .bind(subscribers)
        .bind(job.email_errors)
        .bind(job.email_success)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => Ok(JobId::new(done.last_insert_rowid())),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StoreError::DuplicateName(job.name))
            }
            Err(e) => Err(StoreError::Backend(e.to_string())),
        }
    }

    async fn get_job(&self, id: JobId) -> Result<Job, StoreError> {
        let row = sqlx::query(&format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS))
            .bind(id.as_i64())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?
            .ok_or_else(|| StoreError::NotFound(format!("job: {}", id)))?;
        row_to_job(&row)
    }

    async fn find_job_by_name(&self, name: &str) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!("SELECT {} FROM jobs WHERE name = ?", JOB_COLUMNS))
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!("SELECT {} FROM jobs ORDER BY id", JOB_COLUMNS))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        rows.iter().map(row_to_job).collect()
    }

    async fn save_job(&self, job: &Job) -> Result<(), StoreError> {
        let (command_kind, command_name, command_args, raw_command) =
            command_columns(&job.command);
        let (kind, monitor_url, monitor_error_template, monitor_description) =
            kind_columns(&job.kind);
        let subscribers = serde_json::to_string(&job.subscribers)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let result = sqlx::query(
            "UPDATE jobs SET name = ?, command_kind = ?, command_name = ?, command_args = ?, \
             raw_command = ?, kind = ?, monitor_url = ?, monitor_error_template = ?, \
             monitor_description = ?, frequency = ?, params = ?, timezone = ?, enabled = ?, \
             next_run = ?, last_run_start = ?, last_run_end = ?, last_heartbeat = ?, \
             is_running = ?, last_run_successful = ?, force_run = ?, force_stop = ?, \
             timeout_seconds = ?, target_hostname = ?, current_hostname = ?, current_pid = ?, \
             total_parts = ?, total_parts_complete = ?, maximum_log_entries = ?, \
             log_stdout = ?, log_stderr = ?, subscribers = ?, email_errors = ?, \
             email_success = ? WHERE id = ?",
        )
        .bind(&job.name)
        .bind(command_kind)
        .bind(command_name)
        .bind(command_args)
        .bind(raw_command)
        .bind(kind)
        .bind(monitor_url)
        .bind(monitor_error_template)
        .bind(monitor_description)
        .bind(job.frequency.as_str())
        .bind(&job.params)
        .bind(&job.timezone)
        .bind(job.enabled)
        .bind(to_micros(job.next_run))
        .bind(to_micros(job.last_run_start))
        .bind(to_micros(job.last_run_end))
        .bind(to_micros(job.last_heartbeat))
        .bind(job.is_running)
        .bind(job.last_run_successful)
        .bind(job.force_run)
        .bind(job.force_stop)
        .bind(job.timeout_seconds as i64)
        .bind(&job.target_hostname)
        .bind(&job.current_hostname)
        .bind(job.current_pid.map(|p| p as i64))
        .bind(job.total_parts as i64)
        .bind(job.total_parts_complete as i64)
        .bind(job.maximum_log_entries as i64)
        .bind(job.log_stdout)
        .bind(job.log_stderr)
        .bind(subscribers)
        .bind(job.email_errors)
        .bind(job.email_success)
        .bind(job.id.as_i64())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("job: {}", job.id)));
        }
        self.prune_logs(job.id, job.maximum_log_entries as i64).await
    }

    async fn delete_job(&self, id: JobId) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id.as_i64())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("job: {}", id)));
        }
        // edges and logs cascade, but sqlite only honors that with foreign
        // keys on; delete explicitly to be safe
        sqlx::query("DELETE FROM job_dependencies WHERE dependent_id = ? OR dependee_id = ?")
            .bind(id.as_i64())
            .bind(id.as_i64())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        sqlx::query("DELETE FROM logs WHERE job_id = ?")
            .bind(id.as_i64())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn add_dependency(&self, dep: JobDependency) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO job_dependencies \
             (dependent_id, dependee_id, wait_for_completion, wait_for_success, wait_for_next_run) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(dep.dependent.as_i64())
        .bind(dep.dependee.as_i64())
        .bind(dep.wait_for_completion)
        .bind(dep.wait_for_success)
        .bind(dep.wait_for_next_run)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn remove_dependency(
        &self,
        dependent: JobId,
        dependee: JobId,
    ) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM job_dependencies WHERE dependent_id = ? AND dependee_id = ?")
            .bind(dependent.as_i64())
            .bind(dependee.as_i64())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn clear_dependencies_of(&self, dependent: JobId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM job_dependencies WHERE dependent_id = ?")
            .bind(dependent.as_i64())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn list_dependencies(&self) -> Result<Vec<JobDependency>, StoreError> {
        let rows: Vec<(i64, i64, bool, bool, bool)> = sqlx::query_as(
            "SELECT dependent_id, dependee_id, wait_for_completion, wait_for_success, \
             wait_for_next_run FROM job_dependencies",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|row| JobDependency {
                dependent: JobId::new(row.0),
                dependee: JobId::new(row.1),
                wait_for_completion: row.2,
                wait_for_success: row.3,
                wait_for_next_run: row.4,
            })
            .collect())
    }

    async fn due_jobs(&self, now: DateTime<Utc>, hostname: &str) -> Result<Vec<Job>, StoreError> {
        let sql = format!(
            "SELECT {} FROM jobs WHERE enabled = 1 AND is_running = 0 \
             AND (force_run = 1 OR (next_run IS NOT NULL AND next_run <= ?)) \
             AND (target_hostname IS NULL OR target_hostname = '' OR target_hostname = ?) \
             ORDER BY id",
            JOB_COLUMNS
        );
        let now_micros = now.timestamp_micros();

        if self.exclusive_due_scan {
            let mut conn = self
                .pool
                .acquire()
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            sqlx::query("BEGIN IMMEDIATE")
                .execute(&mut *conn)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            let rows = sqlx::query(&sql)
                .bind(now_micros)
                .bind(hostname)
                .fetch_all(&mut *conn)
                .await;
            let end = sqlx::query("COMMIT").execute(&mut *conn).await;
            let rows = rows.map_err(|e| StoreError::Backend(e.to_string()))?;
            end.map_err(|e| StoreError::Backend(e.to_string()))?;
            return rows.iter().map(row_to_job).collect();
        }

        let rows = sqlx::query(&sql)
            .bind(now_micros)
            .bind(hostname)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        rows.iter().map(row_to_job).collect()
    }

    async fn running_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM jobs WHERE is_running = 1 ORDER BY id",
            JOB_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        rows.iter().map(row_to_job).collect()
    }

    async fn stale_jobs(
        &self,
        now: DateTime<Utc>,
        threshold: Duration,
    ) -> Result<Vec<Job>, StoreError> {
        let cutoff = (now - threshold).timestamp_micros();
        let rows = sqlx::query(&format!(
            "SELECT {} FROM jobs WHERE is_running = 1 \
             AND COALESCE(last_heartbeat, last_run_start, 0) < ? ORDER BY id",
            JOB_COLUMNS
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        rows.iter().map(row_to_job).collect()
    }

    async fn mark_running(
        &self,
        id: JobId,
        hostname: &str,
        pid: u32,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET is_running = 1, current_hostname = ?, current_pid = ?, \
             last_run_start = ?, last_heartbeat = ?, total_parts = 0, \
             total_parts_complete = 0 WHERE id = ?",
        )
        .bind(hostname)
        .bind(pid as i64)
        .bind(now.timestamp_micros())
        .bind(now.timestamp_micros())
        .bind(id.as_i64())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("job: {}", id)));
        }
        Ok(())
    }

    async fn record_heartbeat(
        &self,
        id: JobId,
        now: DateTime<Utc>,
    ) -> Result<HeartbeatTick, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let force_stop: bool = sqlx::query_scalar("SELECT force_stop FROM jobs WHERE id = ?")
            .bind(id.as_i64())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?
            .ok_or_else(|| StoreError::NotFound(format!("job: {}", id)))?;

        sqlx::query(
            "UPDATE jobs SET last_heartbeat = ?, force_stop = 0, force_run = 0 WHERE id = ?",
        )
        .bind(now.timestamp_micros())
        .bind(id.as_i64())
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(HeartbeatTick { force_stop })
    }

    async fn update_progress(
        &self,
        id: JobId,
        total: u32,
        complete: u32,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET total_parts = ?, total_parts_complete = ? WHERE id = ?",
        )
        .bind(total as i64)
        .bind(complete as i64)
        .bind(id.as_i64())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("job: {}", id)));
        }
        Ok(())
    }

    async fn complete_run(&self, id: JobId, completion: &RunCompletion) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET is_running = 0, current_hostname = NULL, current_pid = NULL, \
             force_run = 0, force_stop = 0, last_run_start = ?, last_run_end = ?, \
             last_run_successful = ?, next_run = COALESCE(?, next_run), \
             total_parts_complete = CASE WHEN ? THEN total_parts \
             ELSE total_parts_complete END WHERE id = ?",
        )
        .bind(completion.run_start.timestamp_micros())
        .bind(completion.run_end.timestamp_micros())
        .bind(completion.success)
        .bind(to_micros(completion.next_run))
        .bind(completion.success)
        .bind(id.as_i64())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("job: {}", id)));
        }
        Ok(())
    }

    async fn mark_stale_failure(&self, id: JobId) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET is_running = 0, current_hostname = NULL, current_pid = NULL, \
             force_run = 0, force_stop = 0, last_run_successful = 0 WHERE id = ?",
        )
        .bind(id.as_i64())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("job: {}", id)));
        }
        Ok(())
    }

    async fn clear_running(&self, id: JobId) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET is_running = 0, current_hostname = NULL, current_pid = NULL \
             WHERE id = ?",
        )
        .bind(id.as_i64())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("job: {}", id)));
        }
        Ok(())
    }

    async fn set_force_run(&self, id: JobId, value: bool) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE jobs SET force_run = ? WHERE id = ?")
            .bind(value)
            .bind(id.as_i64())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("job: {}", id)));
        }
        Ok(())
    }

    async fn set_force_stop(&self, id: JobId, value: bool) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE jobs SET force_stop = ? WHERE id = ?")
            .bind(value)
            .bind(id.as_i64())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("job: {}", id)));
        }
        Ok(())
    }

    async fn clear_all_running(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET is_running = 0, current_hostname = NULL, current_pid = NULL \
             WHERE is_running = 1",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(result.rows_affected())
    }

    async fn append_log(&self, entry: LogEntry) -> Result<(), StoreError> {
        let keep: i64 = sqlx::query_scalar("SELECT maximum_log_entries FROM jobs WHERE id = ?")
            .bind(entry.job_id.as_i64())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?
            .ok_or_else(|| StoreError::NotFound(format!("job: {}", entry.job_id)))?;

        sqlx::query(
            "INSERT INTO logs (id, job_id, run_start, run_end, duration_seconds, \
             stdout, stderr, success, on_time, hostname) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(entry.id.as_uuid().to_string())
        .bind(entry.job_id.as_i64())
        .bind(entry.run_start.timestamp_micros())
        .bind(entry.run_end.timestamp_micros())
        .bind(entry.duration_seconds)
        .bind(&entry.stdout)
        .bind(&entry.stderr)
        .bind(entry.success)
        .bind(entry.on_time)
        .bind(&entry.hostname)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        self.prune_logs(entry.job_id, keep).await
    }

    async fn list_logs(&self, job_id: JobId, limit: usize) -> Result<Vec<LogEntry>, StoreError> {
        let rows: Vec<LogRow> = sqlx::query_as(
            "SELECT id, job_id, run_start, run_end, duration_seconds, stdout, stderr, \
             success, on_time, hostname FROM logs WHERE job_id = ? \
             ORDER BY run_start DESC LIMIT ?",
        )
        .bind(job_id.as_i64())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        rows.into_iter().map(row_to_log).collect()
    }

    async fn latest_log(&self, job_id: JobId) -> Result<Option<LogEntry>, StoreError> {
        Ok(self.list_logs(job_id, 1).await?.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::CommandSpec;
    use crate::core::recurrence::Frequency;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, 0).unwrap()
    }

    fn sample_job(name: &str) -> Job {
        Job::builder(name, CommandSpec::Raw("true".into()), Frequency::Daily)
            .next_run(at(9, 0))
            .build()
    }

    #[tokio::test]
    async fn test_job_roundtrip_preserves_fields() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut job = Job::builder(
            "full",
            CommandSpec::Structured {
                name: "cleanup".into(),
                raw_args: "verbose=1 extra".into(),
            },
            Frequency::Weekly,
        )
        .params("byweekday:MO,FR;byhour:6")
        .timezone("America/New_York")
        .timeout_seconds(120)
        .target_hostname("worker-1")
        .subscribers(vec!["ops@example.com".into()])
        .monitor(Some("https://example.com".into()), None, Some("uptime".into()))
        .build();
        job.next_run = Some(at(9, 0));

        let id = store.create_job(job.clone()).await.unwrap();
        let loaded = store.get_job(id).await.unwrap();

        assert_eq!(loaded.name, "full");
        assert_eq!(loaded.command, job.command);
        assert_eq!(loaded.kind, job.kind);
        assert_eq!(loaded.frequency, Frequency::Weekly);
        assert_eq!(loaded.params, job.params);
        assert_eq!(loaded.timezone, "America/New_York");
        assert_eq!(loaded.timeout_seconds, 120);
        assert_eq!(loaded.target_hostname.as_deref(), Some("worker-1"));
        assert_eq!(loaded.subscribers, job.subscribers);
        assert_eq!(loaded.next_run, Some(at(9, 0)));
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.create_job(sample_job("a")).await.unwrap();
        let err = store.create_job(sample_job("a")).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateName(_)));
    }

    #[tokio::test]
    async fn test_due_query_in_sql() {
        let store = SqliteStore::in_memory().await.unwrap();
        let due = store.create_job(sample_job("due")).await.unwrap();
        let mut later = sample_job("later");
        later.next_run = Some(at(23, 0));
        store.create_job(later).await.unwrap();

        let jobs = store.due_jobs(at(10, 0), "host").await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, due);
    }

    #[tokio::test]
    async fn test_heartbeat_transaction() {
        let store = SqliteStore::in_memory().await.unwrap();
        let id = store.create_job(sample_job("hb")).await.unwrap();
        store.set_force_stop(id, true).await.unwrap();

        let tick = store.record_heartbeat(id, at(10, 0)).await.unwrap();
        assert!(tick.force_stop);
        let tick = store.record_heartbeat(id, at(10, 1)).await.unwrap();
        assert!(!tick.force_stop);
    }

    #[tokio::test]
    async fn test_complete_run_and_stale_flow() {
        let store = SqliteStore::in_memory().await.unwrap();
        let id = store.create_job(sample_job("run")).await.unwrap();
        store.mark_running(id, "host", 99, at(10, 0)).await.unwrap();

        let stale = store
            .stale_jobs(at(10, 30), Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);

        store
            .complete_run(
                id,
                &RunCompletion {
                    run_start: at(10, 0),
                    run_end: at(10, 2),
                    success: false,
                    next_run: None,
                },
            )
            .await
            .unwrap();

        let job = store.get_job(id).await.unwrap();
        assert!(!job.is_running);
        assert_eq!(job.last_run_successful, Some(false));
        // completion without a new slot leaves next_run alone
        assert_eq!(job.next_run, Some(at(9, 0)));
        assert!(store
            .stale_jobs(at(10, 30), Duration::minutes(5))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_log_append_and_prune() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut job = sample_job("logs");
        job.maximum_log_entries = 2;
        let id = store.create_job(job).await.unwrap();

        for i in 0..4u32 {
            store
                .append_log(LogEntry::new(
                    id,
                    at(9, i),
                    at(9, i) + Duration::seconds(1),
                    format!("run {}", i),
                    String::new(),
                    true,
                    true,
                    "host".into(),
                ))
                .await
                .unwrap();
        }

        let logs = store.list_logs(id, 10).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].stdout, "run 3");
    }

    #[tokio::test]
    async fn test_zero_log_limit_keeps_everything() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut job = sample_job("unlimited");
        job.maximum_log_entries = 0;
        let id = store.create_job(job).await.unwrap();

        for i in 0..4u32 {
            store
                .append_log(LogEntry::new(
                    id,
                    at(9, i),
                    at(9, i) + Duration::seconds(1),
                    format!("run {}", i),
                    String::new(),
                    true,
                    true,
                    "host".into(),
                ))
                .await
                .unwrap();
        }
        let job = store.get_job(id).await.unwrap();
        store.save_job(&job).await.unwrap();

        assert_eq!(store.list_logs(id, 10).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_dependencies_roundtrip() {
        let store = SqliteStore::in_memory().await.unwrap();
        let a = store.create_job(sample_job("a")).await.unwrap();
        let b = store.create_job(sample_job("b")).await.unwrap();

        let mut edge = JobDependency::new(b, a);
        edge.wait_for_success = true;
        store.add_dependency(edge.clone()).await.unwrap();

        let edges = store.list_dependencies().await.unwrap();
        assert_eq!(edges, vec![edge]);

        store.clear_dependencies_of(b).await.unwrap();
        assert!(store.list_dependencies().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exclusive_due_scan_mode() {
        let store = SqliteStore::in_memory().await.unwrap().with_exclusive_due_scan();
        store.create_job(sample_job("x")).await.unwrap();
        let jobs = store.due_jobs(at(10, 0), "host").await.unwrap();
        assert_eq!(jobs.len(), 1);
    }

    #[tokio::test]
    async fn test_file_backed_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");

        let store = SqliteStore::open(&path).await.unwrap();
        let id = store.create_job(sample_job("durable")).await.unwrap();
        store.close().await;

        let store = SqliteStore::open(&path).await.unwrap();
        let job = store.get_job(id).await.unwrap();
        assert_eq!(job.name, "durable");
        assert_eq!(job.next_run, Some(at(9, 0)));
    }
}
