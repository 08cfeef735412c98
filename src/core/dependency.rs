//! Cross-job dependencies and the cycle-level resolver.
//!
//! Dependencies gate *when* a due job may start; they never trigger runs by
//! themselves. Each edge carries three independent wait conditions that are
//! all required to hold before the dependent may dispatch.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;
use tracing::debug;

use crate::core::job::Job;
use crate::core::types::JobId;

/// Errors from dependency resolution.
#[derive(Debug, Error)]
pub enum DependencyError {
    /// The dependency graph contains a cycle reachable from the due set.
    #[error("dependency cycle detected involving job {0}")]
    CycleDetected(JobId),
}

/// A directed dependency edge: `dependent` waits on `dependee`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDependency {
    pub dependent: JobId,
    pub dependee: JobId,
    /// The dependee must not be running right now.
    #[serde(default = "default_true")]
    pub wait_for_completion: bool,
    /// The dependee's last run must have succeeded.
    #[serde(default)]
    pub wait_for_success: bool,
    /// The dependee's next occurrence must be scheduled no later than the
    /// dependent's.
    #[serde(default)]
    pub wait_for_next_run: bool,
}

fn default_true() -> bool {
    true
}

impl JobDependency {
    /// A plain completion-gated edge.
    pub fn new(dependent: JobId, dependee: JobId) -> Self {
        Self {
            dependent,
            dependee,
            wait_for_completion: true,
            wait_for_success: false,
            wait_for_next_run: false,
        }
    }

    /// Evaluate all wait conditions for this edge.
    ///
    /// `running` supplements the dependee's own `is_running` flag with the
    /// scheduler's view of jobs dispatched earlier in the same cycle.
    pub fn criteria_met(&self, dependent: &Job, dependee: &Job, running: &HashSet<JobId>) -> bool {
        if self.wait_for_completion && (dependee.is_running || running.contains(&dependee.id)) {
            return false;
        }
        if self.wait_for_success && dependee.last_run_successful != Some(true) {
            return false;
        }
        if self.wait_for_next_run {
            // The dependee must be scheduled to run no later than the
            // dependent's own slot. Either slot being unset blocks; a
            // disabled dependee whose slot is never refreshed blocks the
            // dependent for good.
            let (Some(dependent_slot), Some(dependee_slot)) =
                (dependent.next_run, dependee.next_run)
            else {
                if !dependee.enabled {
                    debug!(
                        dependent = %dependent.id,
                        dependee = %dependee.id,
                        "dependent blocked on a disabled dependee; it will not \
                         unblock until the dependee is re-enabled"
                    );
                }
                return false;
            };
            if dependee_slot > dependent_slot {
                return false;
            }
        }
        true
    }
}

/// Resolve the set of due jobs that are actually ready to dispatch, in
/// topological order.
///
/// Jobs with an unmet dependency are dropped, and a dropped job is not
/// treated as a satisfied dependee for jobs evaluated later in the same
/// cycle. The returned order includes the survivors' direct dependees so a
/// caller iterating the list dispatches upstream jobs first; every entry is
/// re-checked for eligibility at dispatch time anyway.
pub fn due_and_ready(
    due: Vec<Job>,
    all_jobs: &HashMap<JobId, Job>,
    edges: &[JobDependency],
    running: &HashSet<JobId>,
) -> Result<Vec<Job>, DependencyError> {
    let mut due = due;
    due.sort_by_key(|j| j.id);

    let mut edges_by_dependent: HashMap<JobId, Vec<&JobDependency>> = HashMap::new();
    for edge in edges {
        edges_by_dependent.entry(edge.dependent).or_default().push(edge);
    }

    let mut dropped: HashSet<JobId> = HashSet::new();
    let mut survivors: Vec<Job> = Vec::new();

    for job in due {
        let mut ready = true;
        for edge in edges_by_dependent.get(&job.id).into_iter().flatten() {
            let Some(dependee) = all_jobs.get(&edge.dependee) else {
                // dangling edge: the dependee was deleted, nothing to wait on
                continue;
            };
            if dropped.contains(&dependee.id) || !edge.criteria_met(&job, dependee, running) {
                debug!(job_id = %job.id, dependee = %dependee.id, "dependencies unmet, skipping");
                ready = false;
                break;
            }
        }
        if ready {
            survivors.push(job);
        } else {
            dropped.insert(job.id);
        }
    }

    topological_order(survivors, all_jobs, &edges_by_dependent)
}

/// Kahn's algorithm over the survivors and their direct dependees.
fn topological_order(
    survivors: Vec<Job>,
    all_jobs: &HashMap<JobId, Job>,
    edges_by_dependent: &HashMap<JobId, Vec<&JobDependency>>,
) -> Result<Vec<Job>, DependencyError> {
    // node set: survivors plus every dependee they point at
    let mut nodes: HashSet<JobId> = survivors.iter().map(|j| j.id).collect();
    for job in &survivors {
        for edge in edges_by_dependent.get(&job.id).into_iter().flatten() {
            if all_jobs.contains_key(&edge.dependee) {
                nodes.insert(edge.dependee);
            }
        }
    }

    // in-degree counts edges from nodes inside the set only
    let mut in_degree: HashMap<JobId, usize> = nodes.iter().map(|id| (*id, 0)).collect();
    let mut downstream: HashMap<JobId, Vec<JobId>> = HashMap::new();
    for id in &nodes {
        for edge in edges_by_dependent.get(id).into_iter().flatten() {
            if nodes.contains(&edge.dependee) {
                *in_degree.get_mut(id).expect("node present") += 1;
                downstream.entry(edge.dependee).or_default().push(*id);
            }
        }
    }

    let mut queue: Vec<JobId> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    queue.sort_unstable();
    let mut queue: VecDeque<JobId> = queue.into();

    let mut order: Vec<JobId> = Vec::with_capacity(nodes.len());
    while let Some(id) = queue.pop_front() {
        order.push(id);
        if let Some(next_ids) = downstream.get(&id) {
            let mut released: Vec<JobId> = Vec::new();
            for next in next_ids {
                let degree = in_degree.get_mut(next).expect("node present");
                *degree -= 1;
                if *degree == 0 {
                    released.push(*next);
                }
            }
            released.sort_unstable();
            queue.extend(released);
        }
    }

    if order.len() != nodes.len() {
        let stuck = in_degree
            .iter()
            .filter(|(_, d)| **d > 0)
            .map(|(id, _)| *id)
            .min()
            .expect("cycle leaves a node with positive in-degree");
        return Err(DependencyError::CycleDetected(stuck));
    }

    let mut by_id: HashMap<JobId, Job> = survivors.into_iter().map(|j| (j.id, j)).collect();
    Ok(order
        .into_iter()
        .filter_map(|id| by_id.remove(&id).or_else(|| all_jobs.get(&id).cloned()))
        .collect())
}
