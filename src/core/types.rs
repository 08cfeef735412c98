//! Core identifier types.
//!
//! These types provide type-safe identifiers for jobs and their log entries.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a job, assigned by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(i64);

/// Unique identifier for an execution log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogId(Uuid);

impl JobId {
    /// Create a JobId from a raw numeric id.
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the underlying numeric value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl From<i64> for JobId {
    fn from(id: i64) -> Self {
        Self::new(id)
    }
}

impl LogId {
    /// Generate a new random LogId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a LogId from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for LogId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_roundtrip() {
        let id = JobId::new(42);
        assert_eq!(id.as_i64(), 42);
        assert_eq!(format!("{}", id), "42");
    }

    #[test]
    fn test_job_id_equality() {
        assert_eq!(JobId::new(1), JobId::from(1));
        assert_ne!(JobId::new(1), JobId::new(2));
    }

    #[test]
    fn test_log_id_is_unique() {
        assert_ne!(LogId::new(), LogId::new());
    }

    #[test]
    fn test_log_id_from_uuid() {
        let uuid = Uuid::new_v4();
        assert_eq!(LogId::from_uuid(uuid).as_uuid(), &uuid);
    }

    #[test]
    fn test_job_ids_are_hashable() {
        use std::collections::HashSet;

        let mut ids: HashSet<JobId> = HashSet::new();
        ids.insert(JobId::new(1));
        ids.insert(JobId::new(2));
        ids.insert(JobId::new(1));
        assert_eq!(ids.len(), 2);
    }
}
