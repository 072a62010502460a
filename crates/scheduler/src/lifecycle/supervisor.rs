//! Timeout and cancel-grace supervision.
//!
//! Two sorted deadline lists. Entries are never removed eagerly: when one
//! expires the task is re-read and the entry is dropped if it no longer
//! applies (task finished, requeued, or given a new deadline).

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, warn};

use mofsim_core::{ErrorKind, TaskError, TaskId, TaskStatus, WorkerId};

use super::{LifecycleManager, TransitionPayload};

#[derive(Debug, Default)]
pub(super) struct Supervisor {
    deadlines: BTreeSet<(DateTime<Utc>, TaskId)>,
    grace: BTreeSet<(DateTime<Utc>, TaskId)>,
}

fn take_expired(set: &mut BTreeSet<(DateTime<Utc>, TaskId)>, now: DateTime<Utc>) -> Vec<TaskId> {
    let mut expired = Vec::new();
    while let Some(first) = set.first().copied() {
        if first.0 > now {
            break;
        }
        set.pop_first();
        expired.push(first.1);
    }
    expired
}

impl Supervisor {
    pub(super) fn watch_deadline(&mut self, at: DateTime<Utc>, id: TaskId) {
        self.deadlines.insert((at, id));
    }

    pub(super) fn watch_grace(&mut self, at: DateTime<Utc>, id: TaskId) {
        self.grace.insert((at, id));
    }

    fn next_due(&self) -> Option<DateTime<Utc>> {
        let d = self.deadlines.first().map(|e| e.0);
        let g = self.grace.first().map(|e| e.0);
        match (d, g) {
            (Some(d), Some(g)) => Some(d.min(g)),
            (d, g) => d.or(g),
        }
    }
}

/// What one supervision pass forced.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SupervisionReport {
    pub forced_cancels: Vec<TaskId>,
    pub timed_out: Vec<TaskId>,
    /// Workers that ignored a stop or overran a deadline.
    pub unreliable_workers: Vec<WorkerId>,
}

impl SupervisionReport {
    pub fn is_empty(&self) -> bool {
        self.forced_cancels.is_empty() && self.timed_out.is_empty()
    }
}

impl LifecycleManager {
    /// Earliest pending grace expiry or deadline.
    pub fn next_supervision_due(&self) -> Option<DateTime<Utc>> {
        self.supervisor.lock().unwrap_or_else(|e| e.into_inner()).next_due()
    }

    /// Force every expired cancel grace window to CANCELLED and every
    /// overrun RUNNING task to TIMEOUT, releasing their GPUs.
    pub fn supervise(&self) -> SupervisionReport {
        let now = self.clock.now();
        let (grace_due, deadlines_due) = {
            let mut sup = self.supervisor.lock().unwrap_or_else(|e| e.into_inner());
            (take_expired(&mut sup.grace, now), take_expired(&mut sup.deadlines, now))
        };
        let mut report = SupervisionReport::default();

        for id in grace_due {
            let result = self.transition_with(id, |task| {
                (task.status.holds_gpu() && task.cancel_requested_at.is_some()).then(|| {
                    (
                        TaskStatus::Cancelled,
                        TransitionPayload::default()
                            .forced()
                            .with_reason("stop not acknowledged within grace window"),
                    )
                })
            });
            match result {
                Ok(Some(view)) => {
                    warn!(task_id = %id, worker_id = ?view.worker_id, "cancel forced after grace window");
                    report.forced_cancels.push(id);
                    report.unreliable_workers.extend(view.worker_id);
                }
                Ok(None) => {}
                Err(e) => error!(task_id = %id, error = %e, "forced cancel failed"),
            }
        }

        for id in deadlines_due {
            let result = self.transition_with(id, |task| {
                let overdue = task.deadline.is_some_and(|d| d <= now);
                (task.status == TaskStatus::Running && overdue).then(|| {
                    let error = TaskError::new(
                        ErrorKind::Timeout,
                        format!("exceeded {}s timeout", task.timeout_secs),
                    );
                    (
                        TaskStatus::Timeout,
                        TransitionPayload::failed(error).with_reason("deadline expired"),
                    )
                })
            });
            match result {
                Ok(Some(view)) => {
                    warn!(task_id = %id, worker_id = ?view.worker_id, "task timed out");
                    if let Some(worker_id) = &view.worker_id {
                        self.workers.request_stop(worker_id, id);
                    }
                    report.timed_out.push(id);
                    report.unreliable_workers.extend(view.worker_id);
                }
                Ok(None) => {}
                Err(e) => error!(task_id = %id, error = %e, "timeout transition failed"),
            }
        }

        report.unreliable_workers.sort();
        report.unreliable_workers.dedup();
        report
    }
}
