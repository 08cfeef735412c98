//! Per-run heartbeat monitor.
//!
//! While a job runs, a background task periodically writes a liveness
//! timestamp so other schedulers can tell a live run from a crashed one.
//! The same tick atomically reads-and-clears the force flags; an observed
//! stop request cancels the run's token and halts the monitor.
//!
//! Lifecycle is strictly created -> running -> halted: [`HeartbeatMonitor::start`]
//! consumes the monitor and [`HeartbeatHandle::stop`] consumes the handle, so
//! a halted monitor can never be restarted.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::types::JobId;
use crate::store::JobStore;

/// Default tick interval.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// A not-yet-started heartbeat for one run.
pub struct HeartbeatMonitor {
    store: Arc<dyn JobStore>,
    job_id: JobId,
    /// Shared with the runner's progress updates so heartbeat writes and
    /// progress writes never interleave.
    guard: Arc<Mutex<()>>,
    /// The run's cancellation token; cancelled when a stop is requested.
    cancel: CancellationToken,
    interval: Duration,
    /// Pid at creation. A tick observing a different pid is running in a
    /// forked child and must not touch the store.
    origin_pid: u32,
}

impl HeartbeatMonitor {
    pub fn new(
        store: Arc<dyn JobStore>,
        job_id: JobId,
        guard: Arc<Mutex<()>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            job_id,
            guard,
            cancel,
            interval: DEFAULT_HEARTBEAT_INTERVAL,
            origin_pid: std::process::id(),
        }
    }

    /// Override the tick interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Start ticking. Consumes the monitor.
    pub fn start(self) -> HeartbeatHandle {
        let halt = CancellationToken::new();
        let halted = halt.clone();
        let task = tokio::spawn(async move { self.run(halted).await });
        HeartbeatHandle { halt, task }
    }

    async fn run(self, halt: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = halt.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if std::process::id() != self.origin_pid {
                return;
            }
            let tick = {
                let _guard = self.guard.lock().await;
                self.store.record_heartbeat(self.job_id, Utc::now()).await
            };
            match tick {
                Ok(tick) if tick.force_stop => {
                    warn!(job_id = %self.job_id, "stop requested, cancelling run");
                    self.cancel.cancel();
                    return;
                }
                Ok(_) => debug!(job_id = %self.job_id, "heartbeat"),
                Err(e) => warn!(job_id = %self.job_id, error = %e, "heartbeat write failed"),
            }
        }
    }
}

/// Handle to a running heartbeat. Consumed by [`stop`](Self::stop).
pub struct HeartbeatHandle {
    halt: CancellationToken,
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    /// Halt the monitor and wait for its final tick to finish.
    pub async fn stop(self) {
        self.halt.cancel();
        let _ = self.task.await;
    }
}

/// Records progress counters for a running job, serialized with the
/// heartbeat through the shared run guard. Store failures are logged and
/// swallowed; progress is advisory.
#[derive(Clone)]
pub struct ProgressRecorder {
    store: Arc<dyn JobStore>,
    job_id: JobId,
    guard: Arc<Mutex<()>>,
}

impl ProgressRecorder {
    pub fn new(store: Arc<dyn JobStore>, job_id: JobId, guard: Arc<Mutex<()>>) -> Self {
        Self {
            store,
            job_id,
            guard,
        }
    }

    /// Report that `complete` of `total` parts are done.
    pub async fn record(&self, total: u32, complete: u32) {
        let _guard = self.guard.lock().await;
        if let Err(e) = self.store.update_progress(self.job_id, total, complete).await {
            warn!(job_id = %self.job_id, error = %e, "progress update failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::{CommandSpec, Job};
    use crate::core::recurrence::Frequency;
    use crate::store::InMemoryStore;

    async fn running_job(store: &InMemoryStore) -> JobId {
        let job = Job::builder("hb", CommandSpec::Raw("true".into()), Frequency::Daily).build();
        let id = store.create_job(job).await.unwrap();
        store
            .mark_running(id, "host", std::process::id(), Utc::now())
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn test_heartbeat_updates_liveness() {
        let store = Arc::new(InMemoryStore::new());
        let id = running_job(&store).await;
        let before = store.get_job(id).await.unwrap().last_heartbeat.unwrap();

        let cancel = CancellationToken::new();
        let monitor = HeartbeatMonitor::new(
            store.clone(),
            id,
            Arc::new(Mutex::new(())),
            cancel.clone(),
        )
        .with_interval(Duration::from_millis(20));
        let handle = monitor.start();

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.stop().await;

        let after = store.get_job(id).await.unwrap().last_heartbeat.unwrap();
        assert!(after >= before);
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_force_stop_cancels_run_token() {
        let store = Arc::new(InMemoryStore::new());
        let id = running_job(&store).await;
        store.set_force_stop(id, true).await.unwrap();

        let cancel = CancellationToken::new();
        let monitor = HeartbeatMonitor::new(
            store.clone(),
            id,
            Arc::new(Mutex::new(())),
            cancel.clone(),
        )
        .with_interval(Duration::from_millis(10));
        let handle = monitor.start();

        tokio::time::timeout(Duration::from_secs(1), cancel.cancelled())
            .await
            .expect("stop request should cancel the run token");

        // the flag was consumed while it cancelled
        assert!(!store.get_job(id).await.unwrap().force_stop);
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_progress_recorder_writes_counters() {
        let store = Arc::new(InMemoryStore::new());
        let id = running_job(&store).await;

        let recorder = ProgressRecorder::new(store.clone(), id, Arc::new(Mutex::new(())));
        recorder.record(10, 3).await;

        let job = store.get_job(id).await.unwrap();
        assert_eq!(job.total_parts, 10);
        assert_eq!(job.total_parts_complete, 3);
        assert_eq!(job.progress_percent(), Some(30));
    }
}
