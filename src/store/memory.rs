//! In-memory storage implementation.
//!
//! Thread-safe backend for tests and single-process development runs. Data
//! is not persisted and is invisible to worker subprocesses; process-mode
//! scheduling needs the SQLite backend.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::RwLock;

use super::{HeartbeatTick, JobStore, LogEntry, RunCompletion, StoreError};
use crate::core::dependency::JobDependency;
use crate::core::job::Job;
use crate::core::types::JobId;

/// In-memory storage backend.
pub struct InMemoryStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    dependencies: RwLock<Vec<JobDependency>>,
    logs: RwLock<HashMap<JobId, Vec<LogEntry>>>,
    next_id: AtomicI64,
}

impl InMemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            dependencies: RwLock::new(Vec::new()),
            logs: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    /// Run a closure against a mutable job, under the write lock.
    fn with_job<T>(
        &self,
        id: JobId,
        f: impl FnOnce(&mut Job) -> T,
    ) -> Result<T, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::LockPoisoned)?;
        let job = jobs
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("job: {}", id)))?;
        Ok(f(job))
    }

    fn prune_logs(&self, id: JobId, keep: usize) -> Result<(), StoreError> {
        // 0 means keep everything
        if keep == 0 {
            return Ok(());
        }
        let mut logs = self.logs.write().map_err(|_| StoreError::LockPoisoned)?;
        if let Some(entries) = logs.get_mut(&id) {
            if entries.len() > keep {
                let excess = entries.len() - keep;
                entries.drain(..excess);
            }
        }
        Ok(())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn create_job(&self, mut job: Job) -> Result<JobId, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::LockPoisoned)?;
        if jobs.values().any(|j| j.name == job.name) {
            return Err(StoreError::DuplicateName(job.name));
        }
        let id = JobId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        job.id = id;
        jobs.insert(id, job);
        Ok(id)
    }

    async fn get_job(&self, id: JobId) -> Result<Job, StoreError> {
        let jobs = self.jobs.read().map_err(|_| StoreError::LockPoisoned)?;
        jobs.get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("job: {}", id)))
    }

    async fn find_job_by_name(&self, name: &str) -> Result<Option<Job>, StoreError> {
        let jobs = self.jobs.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(jobs.values().find(|j| j.name == name).cloned())
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read().map_err(|_| StoreError::LockPoisoned)?;
        let mut result: Vec<_> = jobs.values().cloned().collect();
        result.sort_by_key(|j| j.id);
        Ok(result)
    }

    async fn save_job(&self, job: &Job) -> Result<(), StoreError> {
        {
            let mut jobs = self.jobs.write().map_err(|_| StoreError::LockPoisoned)?;
            if !jobs.contains_key(&job.id) {
                return Err(StoreError::NotFound(format!("job: {}", job.id)));
            }
            if jobs
                .values()
                .any(|j| j.name == job.name && j.id != job.id)
            {
                return Err(StoreError::DuplicateName(job.name.clone()));
            }
            jobs.insert(job.id, job.clone());
        }
        self.prune_logs(job.id, job.maximum_log_entries as usize)
    }

    async fn delete_job(&self, id: JobId) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::LockPoisoned)?;
        jobs.remove(&id)
            .ok_or_else(|| StoreError::NotFound(format!("job: {}", id)))?;
        drop(jobs);

        let mut deps = self
            .dependencies
            .write()
            .map_err(|_| StoreError::LockPoisoned)?;
        deps.retain(|d| d.dependent != id && d.dependee != id);
        drop(deps);

        let mut logs = self.logs.write().map_err(|_| StoreError::LockPoisoned)?;
        logs.remove(&id);
        Ok(())
    }

    async fn add_dependency(&self, dep: JobDependency) -> Result<(), StoreError> {
        let mut deps = self
            .dependencies
            .write()
            .map_err(|_| StoreError::LockPoisoned)?;
        deps.retain(|d| !(d.dependent == dep.dependent && d.dependee == dep.dependee));
        deps.push(dep);
        Ok(())
    }

    async fn remove_dependency(
        &self,
        dependent: JobId,
        dependee: JobId,
    ) -> Result<(), StoreError> {
        let mut deps = self
            .dependencies
            .write()
            .map_err(|_| StoreError::LockPoisoned)?;
        deps.retain(|d| !(d.dependent == dependent && d.dependee == dependee));
        Ok(())
    }

    async fn clear_dependencies_of(&self, dependent: JobId) -> Result<(), StoreError> {
        let mut deps = self
            .dependencies
            .write()
            .map_err(|_| StoreError::LockPoisoned)?;
        deps.retain(|d| d.dependent != dependent);
        Ok(())
    }

    async fn list_dependencies(&self) -> Result<Vec<JobDependency>, StoreError> {
        let deps = self
            .dependencies
            .read()
            .map_err(|_| StoreError::LockPoisoned)?;
        Ok(deps.clone())
    }

    async fn due_jobs(&self, now: DateTime<Utc>, hostname: &str) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read().map_err(|_| StoreError::LockPoisoned)?;
        let mut due: Vec<_> = jobs
            .values()
            .filter(|j| j.is_due(now, hostname))
            .cloned()
            .collect();
        due.sort_by_key(|j| j.id);
        Ok(due)
    }

    async fn running_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(jobs.values().filter(|j| j.is_running).cloned().collect())
    }

    async fn stale_jobs(
        &self,
        now: DateTime<Utc>,
        threshold: Duration,
    ) -> Result<Vec<Job>, StoreError> {
        let cutoff = now - threshold;
        let jobs = self.jobs.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(jobs
            .values()
            .filter(|j| {
                j.is_running
                    && j.liveness_timestamp().map(|t| t < cutoff).unwrap_or(true)
            })
            .cloned()
            .collect())
    }

    async fn mark_running(
        &self,
        id: JobId,
        hostname: &str,
        pid: u32,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.with_job(id, |job| {
            job.is_running = true;
            job.current_hostname = Some(hostname.to_string());
            job.current_pid = Some(pid);
            job.last_run_start = Some(now);
            job.last_heartbeat = Some(now);
            job.total_parts = 0;
            job.total_parts_complete = 0;
        })
    }

    async fn record_heartbeat(
        &self,
        id: JobId,
        now: DateTime<Utc>,
    ) -> Result<HeartbeatTick, StoreError> {
        self.with_job(id, |job| {
            let force_stop = job.force_stop;
            job.last_heartbeat = Some(now);
            job.force_stop = false;
            job.force_run = false;
            HeartbeatTick { force_stop }
        })
    }

    async fn update_progress(
        &self,
        id: JobId,
        total: u32,
        complete: u32,
    ) -> Result<(), StoreError> {
        self.with_job(id, |job| {
            job.total_parts = total;
            job.total_parts_complete = complete;
        })
    }

    async fn complete_run(&self, id: JobId, completion: &RunCompletion) -> Result<(), StoreError> {
        self.with_job(id, |job| {
            job.is_running = false;
            job.current_hostname = None;
            job.current_pid = None;
            job.force_run = false;
            job.force_stop = false;
            job.last_run_start = Some(completion.run_start);
            job.last_run_end = Some(completion.run_end);
            job.last_run_successful = Some(completion.success);
            if let Some(next) = completion.next_run {
                job.next_run = Some(next);
            }
            if completion.success {
                job.total_parts_complete = job.total_parts;
            }
        })
    }

    async fn mark_stale_failure(&self, id: JobId) -> Result<(), StoreError> {
        self.with_job(id, |job| {
            job.is_running = false;
            job.current_hostname = None;
            job.current_pid = None;
            job.force_run = false;
            job.force_stop = false;
            job.last_run_successful = Some(false);
        })
    }

    async fn clear_running(&self, id: JobId) -> Result<(), StoreError> {
        self.with_job(id, |job| {
            job.is_running = false;
            job.current_hostname = None;
            job.current_pid = None;
        })
    }

    async fn set_force_run(&self, id: JobId, value: bool) -> Result<(), StoreError> {
        self.with_job(id, |job| job.force_run = value)
    }

    async fn set_force_stop(&self, id: JobId, value: bool) -> Result<(), StoreError> {
        self.with_job(id, |job| job.force_stop = value)
    }

    async fn clear_all_running(&self) -> Result<u64, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::LockPoisoned)?;
        let mut cleared = 0;
        for job in jobs.values_mut() {
            if job.is_running {
                job.is_running = false;
                job.current_hostname = None;
                job.current_pid = None;
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    async fn append_log(&self, entry: LogEntry) -> Result<(), StoreError> {
        let keep = {
            let jobs = self.jobs.read().map_err(|_| StoreError::LockPoisoned)?;
            jobs.get(&entry.job_id)
                .map(|j| j.maximum_log_entries as usize)
                .ok_or_else(|| StoreError::NotFound(format!("job: {}", entry.job_id)))?
        };
        let job_id = entry.job_id;
        {
            let mut logs = self.logs.write().map_err(|_| StoreError::LockPoisoned)?;
            logs.entry(job_id).or_default().push(entry);
        }
        self.prune_logs(job_id, keep)
    }

    async fn list_logs(&self, job_id: JobId, limit: usize) -> Result<Vec<LogEntry>, StoreError> {
        let logs = self.logs.read().map_err(|_| StoreError::LockPoisoned)?;
        let mut entries = logs.get(&job_id).cloned().unwrap_or_default();
        entries.sort_by(|a, b| b.run_start.cmp(&a.run_start));
        entries.truncate(limit);
        Ok(entries)
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

    async fn store_with(name: &str) -> (InMemoryStore, JobId) {
        let store = InMemoryStore::new();
        let id = store.create_job(sample_job(name)).await.unwrap();
        (store, id)
    }

    #[tokio::test]
    async fn test_create_assigns_ids_and_rejects_duplicates() {
        let store = InMemoryStore::new();
        let a = store.create_job(sample_job("a")).await.unwrap();
        let b = store.create_job(sample_job("b")).await.unwrap();
        assert_ne!(a, b);

        let err = store.create_job(sample_job("a")).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateName(_)));
    }

    #[tokio::test]
    async fn test_due_query_filters() {
        let store = InMemoryStore::new();
        let due_id = store.create_job(sample_job("due")).await.unwrap();
        let mut not_yet = sample_job("not-yet");
        not_yet.next_run = Some(at(11, 0));
        store.create_job(not_yet).await.unwrap();
        let mut pinned = sample_job("pinned");
        pinned.target_hostname = Some("other-host".into());
        store.create_job(pinned).await.unwrap();

        let due = store.due_jobs(at(10, 0), "this-host").await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, due_id);
    }

    #[tokio::test]
    async fn test_forced_job_is_due_even_when_early() {
        let store = InMemoryStore::new();
        let mut job = sample_job("forced");
        job.next_run = Some(at(23, 0));
        let id = store.create_job(job).await.unwrap();
        store.set_force_run(id, true).await.unwrap();

        let due = store.due_jobs(at(10, 0), "host").await.unwrap();
        assert_eq!(due.len(), 1);

        // running jobs are never due, forced or not
        store.mark_running(id, "host", 123, at(10, 0)).await.unwrap();
        assert!(store.due_jobs(at(10, 0), "host").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_running_records_ownership() {
        let (store, id) = store_with("job").await;
        store.mark_running(id, "host-a", 4242, at(10, 0)).await.unwrap();

        let job = store.get_job(id).await.unwrap();
        assert!(job.is_running);
        assert_eq!(job.current_hostname.as_deref(), Some("host-a"));
        assert_eq!(job.current_pid, Some(4242));
        assert_eq!(job.last_run_start, Some(at(10, 0)));
        assert_eq!(job.last_heartbeat, Some(at(10, 0)));
    }

    #[tokio::test]
    async fn test_heartbeat_reads_and_clears_force_stop() {
        let (store, id) = store_with("job").await;
        store.set_force_stop(id, true).await.unwrap();

        let tick = store.record_heartbeat(id, at(10, 1)).await.unwrap();
        assert!(tick.force_stop);

        // the flag was consumed
        let tick = store.record_heartbeat(id, at(10, 2)).await.unwrap();
        assert!(!tick.force_stop);
        let job = store.get_job(id).await.unwrap();
        assert!(!job.force_stop);
        assert_eq!(job.last_heartbeat, Some(at(10, 2)));
    }

    #[tokio::test]
    async fn test_complete_run_clears_state_atomically() {
        let (store, id) = store_with("job").await;
        store.mark_running(id, "host", 1, at(10, 0)).await.unwrap();
        store.set_force_run(id, true).await.unwrap();
        store.update_progress(id, 4, 2).await.unwrap();

        store
            .complete_run(
                id,
                &RunCompletion {
                    run_start: at(10, 0),
                    run_end: at(10, 5),
                    success: true,
                    next_run: Some(at(12, 0)),
                },
            )
            .await
            .unwrap();

        let job = store.get_job(id).await.unwrap();
        assert!(!job.is_running);
        assert_eq!(job.current_hostname, None);
        assert_eq!(job.current_pid, None);
        assert!(!job.force_run);
        assert_eq!(job.last_run_end, Some(at(10, 5)));
        assert_eq!(job.last_run_successful, Some(true));
        assert_eq!(job.next_run, Some(at(12, 0)));
        // progress rolls up on success
        assert_eq!(job.total_parts_complete, job.total_parts);
    }

    #[tokio::test]
    async fn test_stale_query_uses_liveness_timestamp() {
        let (store, id) = store_with("job").await;
        store.mark_running(id, "host", 1, at(9, 0)).await.unwrap();

        let threshold = Duration::minutes(5);
        // heartbeat fresh at 09:00, checking at 09:04: not stale
        assert!(store.stale_jobs(at(9, 4), threshold).await.unwrap().is_empty());
        // at 09:06 the 09:00 heartbeat is past the threshold
        let stale = store.stale_jobs(at(9, 6), threshold).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, id);

        // a fresh heartbeat revives it
        store.record_heartbeat(id, at(9, 6)).await.unwrap();
        assert!(store.stale_jobs(at(9, 7), threshold).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_stale_failure() {
        let (store, id) = store_with("job").await;
        store.mark_running(id, "host", 1, at(9, 0)).await.unwrap();
        store.mark_stale_failure(id).await.unwrap();

        let job = store.get_job(id).await.unwrap();
        assert!(!job.is_running);
        assert_eq!(job.last_run_successful, Some(false));
        assert_eq!(job.current_pid, None);
    }

    #[tokio::test]
    async fn test_clear_all_running() {
        let store = InMemoryStore::new();
        let a = store.create_job(sample_job("a")).await.unwrap();
        let b = store.create_job(sample_job("b")).await.unwrap();
        store.mark_running(a, "host", 1, at(9, 0)).await.unwrap();
        store.mark_running(b, "host", 2, at(9, 0)).await.unwrap();

        assert_eq!(store.clear_all_running().await.unwrap(), 2);
        assert!(store.running_jobs().await.unwrap().is_empty());
        assert_eq!(store.clear_all_running().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_log_pruning_keeps_newest() {
        let store = InMemoryStore::new();
        let mut job = sample_job("job");
        job.maximum_log_entries = 3;
        let id = store.create_job(job).await.unwrap();

        for i in 0..5u32 {
            let entry = LogEntry::new(
                id,
                at(9, i),
                at(9, i) + Duration::seconds(10),
                format!("run {}", i),
                String::new(),
                true,
                true,
                "host".into(),
            );
            store.append_log(entry).await.unwrap();
        }

        let logs = store.list_logs(id, 10).await.unwrap();
        assert_eq!(logs.len(), 3);
        // newest first
        assert_eq!(logs[0].stdout, "run 4");
        assert_eq!(logs[2].stdout, "run 2");

        let latest = store.latest_log(id).await.unwrap().unwrap();
        assert_eq!(latest.stdout, "run 4");
    }

    #[tokio::test]
    async fn test_zero_log_limit_keeps_everything() {
        let store = InMemoryStore::new();
        let mut job = sample_job("job");
        job.maximum_log_entries = 0;
        let id = store.create_job(job).await.unwrap();

        for i in 0..5u32 {
            let entry = LogEntry::new(
                id,
                at(9, i),
                at(9, i) + Duration::seconds(10),
                format!("run {}", i),
                String::new(),
                true,
                true,
                "host".into(),
            );
            store.append_log(entry).await.unwrap();
        }
        // save_job prunes as a side effect; 0 must leave history alone too
        let job = store.get_job(id).await.unwrap();
        store.save_job(&job).await.unwrap();

        assert_eq!(store.list_logs(id, 10).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_dependency_edges_roundtrip() {
        let store = InMemoryStore::new();
        let a = store.create_job(sample_job("a")).await.unwrap();
        let b = store.create_job(sample_job("b")).await.unwrap();

        store.add_dependency(JobDependency::new(b, a)).await.unwrap();
        assert_eq!(store.list_dependencies().await.unwrap().len(), 1);

        store.remove_dependency(b, a).await.unwrap();
        assert!(store.list_dependencies().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_job_removes_edges_and_logs() {
        let store = InMemoryStore::new();
        let a = store.create_job(sample_job("a")).await.unwrap();
        let b = store.create_job(sample_job("b")).await.unwrap();
        store.add_dependency(JobDependency::new(b, a)).await.unwrap();

        store.delete_job(a).await.unwrap();
        assert!(store.list_dependencies().await.unwrap().is_empty());
        assert!(matches!(
            store.get_job(a).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
