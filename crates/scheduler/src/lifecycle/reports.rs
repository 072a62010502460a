//! Worker-originated updates: start, terminal outcome, out-of-memory, and
//! failure of the worker itself.

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use mofsim_core::{
    ErrorKind, GpuId, SchedulerError, Task, TaskError, TaskId, TaskStatus, TaskView, MB,
};

use super::{LifecycleManager, TransitionPayload};

/// Terminal report from a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed,
    Failed { kind: ErrorKind, message: String },
    /// Acknowledges a stop request.
    Cancelled,
}

/// Reports for finished tasks arrive late when a forced transition beat
/// them; they are dropped rather than treated as illegal.
fn is_stale(task: &Task, what: &str) -> bool {
    if task.is_terminal() {
        warn!(task_id = %task.id, status = %task.status, report = what, "stale worker report ignored");
        true
    } else {
        false
    }
}

impl LifecycleManager {
    /// ASSIGNED -> RUNNING. Starts the task's deadline and records its model
    /// as resident on the GPU.
    pub fn report_started(&self, id: TaskId, worker_id: &str) -> Result<TaskView, SchedulerError> {
        let task = self.snapshot(&id).ok_or(SchedulerError::TaskNotFound(id))?;
        if task.worker_id.as_deref() != Some(worker_id) && task.status.holds_gpu() {
            return Err(SchedulerError::Validation(format!(
                "task {id} is not bound to worker {worker_id}"
            )));
        }
        let started = self.transition_with(id, |task| {
            if is_stale(task, "started") || task.status == TaskStatus::Running {
                return None;
            }
            Some((
                TaskStatus::Running,
                TransitionPayload::default().with_reason("worker started"),
            ))
        })?;
        match started {
            Some(view) => {
                if let Some(gpu_id) = view.gpu_id {
                    self.registry.note_model_loaded(gpu_id, &view.model_id);
                }
                Ok(view)
            }
            None => self.get_status(&id),
        }
    }

    /// Terminal report from the worker. An out-of-memory failure is routed
    /// to [`LifecycleManager::report_oom`].
    pub fn report(&self, id: TaskId, outcome: TaskOutcome) -> Result<TaskView, SchedulerError> {
        if let TaskOutcome::Failed {
            kind: ErrorKind::OutOfMemory,
            ..
        } = &outcome
        {
            let task = self.snapshot(&id).ok_or(SchedulerError::TaskNotFound(id))?;
            return self.report_oom(id, &task.model_id);
        }

        let done = self.transition_with(id, |task| {
            if is_stale(task, "outcome") {
                return None;
            }
            Some(match &outcome {
                TaskOutcome::Completed => (
                    TaskStatus::Completed,
                    TransitionPayload::default().with_reason("worker completed"),
                ),
                TaskOutcome::Failed { kind, message } => (
                    TaskStatus::Failed,
                    TransitionPayload::failed(TaskError::new(*kind, message.clone()))
                        .with_reason("worker reported failure"),
                ),
                TaskOutcome::Cancelled => (
                    TaskStatus::Cancelled,
                    TransitionPayload::default().with_reason("worker acknowledged stop"),
                ),
            })
        })?;
        match done {
            Some(view) => Ok(view),
            None => self.get_status(&id),
        }
    }

    /// Out-of-memory on a worker. The model's base cost is raised for good;
    /// the task is requeued with the revised estimate while its retry budget
    /// lasts and failed terminally after that.
    pub fn report_oom(&self, id: TaskId, model_id: &str) -> Result<TaskView, SchedulerError> {
        let task = self.snapshot(&id).ok_or(SchedulerError::TaskNotFound(id))?;
        if is_stale(&task, "oom") {
            return Ok(self.view_of(&task));
        }
        if !task.status.holds_gpu() {
            warn!(task_id = %id, status = %task.status, "oom report for a task without a GPU ignored");
            return Ok(self.view_of(&task));
        }
        let raised = self.estimator.record_oom(model_id);
        let largest = self.registry.largest_usable_bytes();
        let max_retries = self.config.max_oom_retries;

        let done = self.transition_with(id, |task| {
            if is_stale(task, "oom") || !task.status.holds_gpu() {
                return None;
            }
            if task.cancel_requested_at.is_some() {
                return Some((
                    TaskStatus::Cancelled,
                    TransitionPayload::default().with_reason("ran out of memory while stopping"),
                ));
            }
            let estimate = self.estimator.estimate(&task.model_id, task.atom_count, task.kind);
            let fail = |message: String| {
                Some((
                    TaskStatus::Failed,
                    TransitionPayload::failed(TaskError::new(ErrorKind::OutOfMemory, message))
                        .with_reason("out of memory"),
                ))
            };
            if task.retry_count >= max_retries {
                return fail(format!(
                    "out of GPU memory after {} retr{} (estimate {} MB)",
                    task.retry_count,
                    if task.retry_count == 1 { "y" } else { "ies" },
                    task.estimate_bytes / MB
                ));
            }
            if estimate > largest {
                return fail(format!(
                    "revised estimate {} MB exceeds the largest GPU's usable {} MB",
                    estimate / MB,
                    largest / MB
                ));
            }
            Some((
                TaskStatus::Queued,
                TransitionPayload::requeue(
                    estimate,
                    TaskError::new(
                        ErrorKind::OutOfMemory,
                        format!("out of GPU memory at {} MB, requeued", task.estimate_bytes / MB),
                    ),
                )
                .with_reason("out of memory, requeued"),
            ))
        })?;

        let view = match done {
            Some(view) => view,
            None => self.get_status(&id)?,
        };
        info!(
            task_id = %id,
            model = model_id,
            base_mb = raised / MB,
            status = %view.status,
            retry_count = view.retry_count,
            "out-of-memory report handled"
        );
        Ok(view)
    }

    /// ASSIGNED/RUNNING tasks bound to a worker.
    pub fn tasks_held_by(&self, worker_id: &str) -> Vec<TaskId> {
        self.read_tasks()
            .values()
            .filter(|t| t.status.holds_gpu() && t.worker_id.as_deref() == Some(worker_id))
            .map(|t| t.id)
            .collect()
    }

    /// Fail every task held by a worker that went offline. No retry: the
    /// cause is unknown hardware or process state.
    pub fn fail_worker_tasks(&self, worker_id: &str, gpu_id: GpuId) -> Vec<TaskId> {
        let bound: Vec<TaskId> = self
            .read_tasks()
            .values()
            .filter(|t| {
                t.status.holds_gpu()
                    && (t.worker_id.as_deref() == Some(worker_id) || t.gpu_id == Some(gpu_id))
            })
            .map(|t| t.id)
            .collect();

        let mut failed = Vec::new();
        for id in bound {
            let result = self.transition_with(id, |task| {
                task.status.holds_gpu().then(|| {
                    (
                        TaskStatus::Failed,
                        TransitionPayload::failed(TaskError::new(
                            ErrorKind::WorkerOffline,
                            format!("worker {worker_id} on GPU {gpu_id} went offline"),
                        ))
                        .with_reason("worker offline"),
                    )
                })
            });
            match result {
                Ok(Some(_)) => failed.push(id),
                Ok(None) => {}
                Err(e) => error!(task_id = %id, error = %e, "failed to fail task of offline worker"),
            }
        }
        failed
    }
}
