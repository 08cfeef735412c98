//! Cadence is a dependency-aware recurring-job scheduler.
//!
//! Jobs carry an rrule-style recurrence, optional dependency edges on
//! other jobs, and a full run-state (schedule slot, running claim,
//! heartbeat, force flags). A scheduling cycle reaps stale runs, resolves
//! the due set against the dependency graph, and dispatches each runnable
//! job as an isolated worker process. A run succeeds exactly when it
//! produced no stderr.

pub mod config;
pub mod core;
pub mod execution;
pub mod notify;
pub mod scheduler;
pub mod store;

pub use crate::core::job::{CommandSpec, Job, JobKind};
pub use crate::core::recurrence::{Frequency, RecurrenceRule};
pub use crate::core::types::{JobId, LogId};
pub use execution::JobRunner;
pub use scheduler::Scheduler;
pub use store::{InMemoryStore, JobStore, SqliteStore};
