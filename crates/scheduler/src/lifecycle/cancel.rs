use chrono::Duration;
use serde::Serialize;
use tracing::{debug, info};

use mofsim_core::{SchedulerError, TaskId, TaskStatus, TransitionError, WorkerId};

use super::{LifecycleManager, TransitionPayload, MAX_CONFLICT_RETRIES};

/// What a `cancel` call did. Every variant is a success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// QUEUED task removed and cancelled on the spot.
    Cancelled,
    /// Stop sent to the bound worker; the grace window is running.
    StopRequested,
    /// A stop is already pending; nothing changed.
    AlreadyRequested,
    /// The task was already cancelled; nothing changed.
    AlreadyCancelled,
}

impl LifecycleManager {
    /// Cancel a task. Idempotent: repeated calls never error on a task that
    /// is cancelled or being cancelled, and never release a GPU twice.
    pub fn cancel(&self, id: TaskId) -> Result<CancelOutcome, SchedulerError> {
        let mut last_conflict = None;
        for _ in 0..MAX_CONFLICT_RETRIES {
            let task = self.snapshot(&id).ok_or(SchedulerError::TaskNotFound(id))?;
            let attempt = match task.status {
                TaskStatus::Cancelled => return Ok(CancelOutcome::AlreadyCancelled),
                status @ (TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Timeout) => {
                    return Err(SchedulerError::NotCancellable { task_id: id, status })
                }
                TaskStatus::Assigned | TaskStatus::Running if task.cancel_requested_at.is_some() => {
                    return Ok(CancelOutcome::AlreadyRequested)
                }
                TaskStatus::Queued => self
                    .transition(
                        id,
                        task.version,
                        TaskStatus::Cancelled,
                        TransitionPayload::default().with_reason("cancelled while queued"),
                    )
                    .map(|_| CancelOutcome::Cancelled),
                TaskStatus::Assigned | TaskStatus::Running => {
                    self.request_stop(id, task.version).map(|worker_id| {
                        self.workers.request_stop(&worker_id, id);
                        CancelOutcome::StopRequested
                    })
                }
                // Never observable outside `submit`.
                TaskStatus::Pending => Err(TransitionError::VersionConflict {
                    expected: task.version,
                    actual: task.version,
                }),
            };
            match attempt {
                Ok(outcome) => return Ok(outcome),
                Err(conflict @ TransitionError::VersionConflict { .. }) => {
                    debug!(task_id = %id, "cancel raced another writer, re-reading");
                    last_conflict = Some(conflict);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(last_conflict.unwrap_or(TransitionError::NotFound(id)).into())
    }

    /// Mark a GPU-holding task as cancel-requested and start its grace
    /// window. Returns the worker to notify.
    fn request_stop(&self, id: TaskId, expected_version: u64) -> Result<WorkerId, TransitionError> {
        let mut tasks = self.write_tasks();
        let task = tasks.get_mut(&id).ok_or(TransitionError::NotFound(id))?;
        if task.version != expected_version {
            return Err(TransitionError::VersionConflict {
                expected: expected_version,
                actual: task.version,
            });
        }
        if !task.status.holds_gpu() {
            return Err(TransitionError::IllegalTransition {
                from: task.status,
                to: TaskStatus::Cancelled,
            });
        }
        let worker_id = task
            .worker_id
            .clone()
            .ok_or_else(|| TransitionError::InvalidPayload(format!("task {id} holds a GPU without a worker")))?;

        let now = self.clock.now();
        let grace_until = now + Duration::seconds(self.config.cancel_grace_secs as i64);
        task.cancel_requested_at = Some(now);
        task.version += 1;
        self.supervisor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .watch_grace(grace_until, id);
        info!(
            task_id = %id,
            worker_id = %worker_id,
            grace_secs = self.config.cancel_grace_secs,
            "stop requested"
        );
        Ok(worker_id)
    }
}
