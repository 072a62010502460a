use std::collections::HashMap;

use chrono::Duration;
use tracing::{debug, error, info};

use mofsim_core::{
    ErrorKind, GpuId, SchedulerEvent, StatusChange, Task, TaskError, TaskId, TaskStatus, TaskView,
    TransitionError, WorkerId,
};

use super::{fsm, LifecycleManager};
use crate::worker::Assignment;

/// Data carried by a transition. Which fields are required depends on the
/// target status; anything else is ignored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitionPayload {
    /// Required for ASSIGNED.
    pub gpu_id: Option<GpuId>,
    /// Required for ASSIGNED.
    pub worker_id: Option<WorkerId>,
    /// Required for FAILED; recorded on requeue.
    pub error: Option<TaskError>,
    /// Required for a requeue (ASSIGNED/RUNNING -> QUEUED).
    pub estimate_bytes: Option<u64>,
    /// CANCELLED without a worker acknowledgement.
    pub forced: bool,
    pub reason: Option<String>,
}

impl TransitionPayload {
    pub fn assign(gpu_id: GpuId, worker_id: impl Into<WorkerId>) -> Self {
        Self {
            gpu_id: Some(gpu_id),
            worker_id: Some(worker_id.into()),
            ..Self::default()
        }
    }

    pub fn failed(error: TaskError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    pub fn requeue(estimate_bytes: u64, error: TaskError) -> Self {
        Self {
            estimate_bytes: Some(estimate_bytes),
            error: Some(error),
            ..Self::default()
        }
    }

    pub fn forced(mut self) -> Self {
        self.forced = true;
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Outcome of a committed transition, handed back once the store lock is
/// released.
pub(super) struct Applied {
    pub view: TaskView,
    pub events: Vec<SchedulerEvent>,
}

impl LifecycleManager {
    /// Move a task to `to`, provided it is still at `expected_version`.
    pub fn transition(
        &self,
        id: TaskId,
        expected_version: u64,
        to: TaskStatus,
        payload: TransitionPayload,
    ) -> Result<TaskView, TransitionError> {
        let applied = {
            let mut tasks = self.write_tasks();
            self.apply(&mut tasks, id, expected_version, to, payload)?
        };
        self.events.publish_all(applied.events);
        Ok(applied.view)
    }

    /// QUEUED -> ASSIGNED, then hand the work to the bound worker. The GPU
    /// must already be allocated to this task.
    pub fn assign(
        &self,
        id: TaskId,
        expected_version: u64,
        gpu_id: GpuId,
        worker_id: &str,
    ) -> Result<TaskView, TransitionError> {
        let view = self.transition(
            id,
            expected_version,
            TaskStatus::Assigned,
            TransitionPayload::assign(gpu_id, worker_id).with_reason("placed"),
        )?;
        self.workers.dispatch(
            worker_id,
            Assignment {
                task_id: id,
                gpu_id,
                kind: view.kind,
                model_id: view.model_id.clone(),
                structure_id: view.structure_id.clone(),
                atom_count: view.atom_count,
                estimate_bytes: view.estimate_bytes,
                timeout_secs: view.timeout_secs,
            },
        );
        Ok(view)
    }

    fn check(&self, task: &Task, expected_version: u64, to: TaskStatus, payload: &TransitionPayload) -> Result<(), TransitionError> {
        if task.version != expected_version {
            return Err(TransitionError::VersionConflict {
                expected: expected_version,
                actual: task.version,
            });
        }
        if !fsm::is_allowed(task.status, to) {
            return Err(TransitionError::IllegalTransition {
                from: task.status,
                to,
            });
        }
        match to {
            TaskStatus::Assigned => match (payload.gpu_id, &payload.worker_id) {
                (Some(gpu_id), Some(_)) => {
                    let holder = self.registry.get(gpu_id).and_then(|gpu| gpu.current_task);
                    if holder == Some(task.id) {
                        Ok(())
                    } else {
                        Err(TransitionError::InvalidPayload(format!(
                            "GPU {gpu_id} is not allocated to task {}",
                            task.id
                        )))
                    }
                }
                _ => Err(TransitionError::InvalidPayload(
                    "assignment needs a GPU and a worker".into(),
                )),
            },
            TaskStatus::Failed if payload.error.is_none() => Err(TransitionError::InvalidPayload(
                "failure needs an error kind and message".into(),
            )),
            TaskStatus::Queued if task.status != TaskStatus::Pending && payload.estimate_bytes.is_none() => Err(
                TransitionError::InvalidPayload("requeue needs a revised estimate".into()),
            ),
            _ => Ok(()),
        }
    }

    /// Validate then commit a transition on a locked store. Nothing is
    /// touched unless every check passes.
    pub(super) fn apply(
        &self,
        tasks: &mut HashMap<TaskId, Task>,
        id: TaskId,
        expected_version: u64,
        to: TaskStatus,
        payload: TransitionPayload,
    ) -> Result<Applied, TransitionError> {
        let task = tasks.get_mut(&id).ok_or(TransitionError::NotFound(id))?;
        if let Err(e) = self.check(task, expected_version, to, &payload) {
            match &e {
                TransitionError::IllegalTransition { from, to } => {
                    error!(critical = true, task_id = %id, %from, %to, "illegal task transition rejected")
                }
                TransitionError::VersionConflict { expected, actual } => {
                    debug!(task_id = %id, expected, actual, "stale task version")
                }
                other => error!(task_id = %id, error = %other, "transition payload rejected"),
            }
            return Err(e);
        }

        let now = self.clock.now();
        let from = task.status;
        let mut events = Vec::new();

        if from == TaskStatus::Queued {
            self.queue.commit_dequeue(&id);
        }
        // Leaving a GPU-holding state frees the GPU, unless someone else
        // (error marking, a newer allocation) already owns it.
        if from.holds_gpu() && !to.holds_gpu() {
            if let Some(gpu_id) = task.gpu_id {
                self.registry.release_task(gpu_id, &id);
            }
        }

        match to {
            TaskStatus::Queued => {
                if from != TaskStatus::Pending {
                    task.retry_count += 1;
                    task.estimate_bytes = payload.estimate_bytes.unwrap_or(task.estimate_bytes);
                    task.gpu_id = None;
                    task.worker_id = None;
                    task.started_at = None;
                    task.deadline = None;
                    task.cancel_requested_at = None;
                    task.error = payload.error.clone();
                    events.push(SchedulerEvent::TaskRequeued {
                        task_id: id,
                        retry_count: task.retry_count,
                        estimate_bytes: task.estimate_bytes,
                        at: now,
                    });
                } else {
                    events.push(SchedulerEvent::TaskQueued {
                        task_id: id,
                        priority: task.priority,
                        at: now,
                    });
                }
                // Original arrival: a requeued task keeps its place in line.
                self.queue.enqueue(id, task.priority, task.arrival, task.arrival_seq);
            }
            TaskStatus::Assigned => {
                task.gpu_id = payload.gpu_id;
                task.worker_id = payload.worker_id.clone();
                if let (Some(gpu_id), Some(worker_id)) = (task.gpu_id, task.worker_id.clone()) {
                    events.push(SchedulerEvent::TaskAssigned {
                        task_id: id,
                        gpu_id,
                        worker_id,
                        at: now,
                    });
                }
            }
            TaskStatus::Running => {
                let deadline = now + Duration::seconds(task.timeout_secs as i64);
                task.started_at = Some(now);
                task.deadline = Some(deadline);
                self.supervisor
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .watch_deadline(deadline, id);
                if let (Some(gpu_id), Some(worker_id)) = (task.gpu_id, task.worker_id.clone()) {
                    events.push(SchedulerEvent::TaskStarted {
                        task_id: id,
                        gpu_id,
                        worker_id,
                        at: now,
                    });
                }
            }
            TaskStatus::Completed => {
                task.completed_at = Some(now);
                events.push(SchedulerEvent::TaskCompleted {
                    task_id: id,
                    gpu_id: task.gpu_id,
                    at: now,
                });
            }
            TaskStatus::Failed => {
                task.completed_at = Some(now);
                task.error = payload.error.clone();
                if let Some(err) = &task.error {
                    events.push(SchedulerEvent::TaskFailed {
                        task_id: id,
                        kind: err.kind,
                        message: err.message.clone(),
                        at: now,
                    });
                }
            }
            TaskStatus::Timeout => {
                task.completed_at = Some(now);
                task.error = Some(payload.error.clone().unwrap_or_else(|| {
                    TaskError::new(
                        ErrorKind::Timeout,
                        format!("exceeded {}s timeout", task.timeout_secs),
                    )
                }));
                events.push(SchedulerEvent::TaskTimeout {
                    task_id: id,
                    gpu_id: task.gpu_id,
                    at: now,
                });
            }
            TaskStatus::Cancelled => {
                task.completed_at = Some(now);
                events.push(SchedulerEvent::TaskCancelled {
                    task_id: id,
                    forced: payload.forced,
                    at: now,
                });
            }
            TaskStatus::Pending => {}
        }

        task.history.push(StatusChange {
            from,
            to,
            at: now,
            reason: payload.reason,
        });
        task.status = to;
        task.version += 1;

        info!(
            task_id = %id,
            %from,
            %to,
            version = task.version,
            gpu_id = ?task.gpu_id,
            "task transition"
        );
        Ok(Applied {
            view: self.view_of(task),
            events,
        })
    }
}
