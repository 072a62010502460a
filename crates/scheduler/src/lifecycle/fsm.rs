//! Task status transition table.
//!
//! ```text
//! PENDING  -> QUEUED
//! QUEUED   -> ASSIGNED | CANCELLED
//! ASSIGNED -> RUNNING | CANCELLED | FAILED | QUEUED (oom requeue)
//! RUNNING  -> COMPLETED | FAILED | TIMEOUT | CANCELLED | QUEUED (oom requeue)
//! ```
//!
//! Terminal states have no outgoing edges.

use mofsim_core::TaskStatus;

pub fn is_allowed(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;
    matches!(
        (from, to),
        (Pending, Queued)
            | (Queued, Assigned)
            | (Queued, Cancelled)
            | (Assigned, Running)
            | (Assigned, Cancelled)
            | (Assigned, Failed)
            | (Assigned, Queued)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Timeout)
            | (Running, Cancelled)
            | (Running, Queued)
    )
}

/// Every status reachable from `from` in one step.
pub fn successors(from: TaskStatus) -> Vec<TaskStatus> {
    TaskStatus::ALL
        .into_iter()
        .filter(|to| is_allowed(from, *to))
        .collect()
}
