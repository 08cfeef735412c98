//! Core domain types: identifiers, jobs, recurrence rules, dependencies.

pub mod dependency;
pub mod job;
pub mod recurrence;
pub mod types;
