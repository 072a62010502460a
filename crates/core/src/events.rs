//! Typed lifecycle events.
//!
//! The scheduler publishes these on its event stream; the webhook dispatcher,
//! alerting engine and audit log consume them. Each variant maps to a
//! namespace-qualified topic in [`topics`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ErrorKind, GpuId, Priority, TaskId, WorkerId};

pub mod topics {
    //! Topics follow the pattern `mofsim.<domain>.<event>`.

    pub const TASK_QUEUED: &str = "mofsim.task.queued";
    pub const TASK_ASSIGNED: &str = "mofsim.task.assigned";
    pub const TASK_STARTED: &str = "mofsim.task.started";
    pub const TASK_COMPLETED: &str = "mofsim.task.completed";
    pub const TASK_FAILED: &str = "mofsim.task.failed";
    pub const TASK_CANCELLED: &str = "mofsim.task.cancelled";
    pub const TASK_TIMEOUT: &str = "mofsim.task.timeout";
    /// Task went back to the queue after an out-of-memory report.
    pub const TASK_REQUEUED: &str = "mofsim.task.requeued";

    pub const WORKER_DOWN: &str = "mofsim.worker.down";

    pub const GPU_ERROR: &str = "mofsim.gpu.error";
    pub const GPU_RECOVERED: &str = "mofsim.gpu.recovered";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SchedulerEvent {
    TaskQueued {
        task_id: TaskId,
        priority: Priority,
        at: DateTime<Utc>,
    },
    TaskAssigned {
        task_id: TaskId,
        gpu_id: GpuId,
        worker_id: WorkerId,
        at: DateTime<Utc>,
    },
    TaskStarted {
        task_id: TaskId,
        gpu_id: GpuId,
        worker_id: WorkerId,
        at: DateTime<Utc>,
    },
    TaskCompleted {
        task_id: TaskId,
        gpu_id: Option<GpuId>,
        at: DateTime<Utc>,
    },
    TaskFailed {
        task_id: TaskId,
        kind: ErrorKind,
        message: String,
        at: DateTime<Utc>,
    },
    TaskCancelled {
        task_id: TaskId,
        /// True when the grace window expired without an acknowledgement.
        forced: bool,
        at: DateTime<Utc>,
    },
    TaskTimeout {
        task_id: TaskId,
        gpu_id: Option<GpuId>,
        at: DateTime<Utc>,
    },
    TaskRequeued {
        task_id: TaskId,
        retry_count: u32,
        estimate_bytes: u64,
        at: DateTime<Utc>,
    },
    WorkerDown {
        worker_id: WorkerId,
        gpu_id: GpuId,
        last_heartbeat: DateTime<Utc>,
        at: DateTime<Utc>,
    },
    GpuError {
        gpu_id: GpuId,
        message: String,
        at: DateTime<Utc>,
    },
    GpuRecovered {
        gpu_id: GpuId,
        at: DateTime<Utc>,
    },
}

impl SchedulerEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            SchedulerEvent::TaskQueued { .. } => topics::TASK_QUEUED,
            SchedulerEvent::TaskAssigned { .. } => topics::TASK_ASSIGNED,
            SchedulerEvent::TaskStarted { .. } => topics::TASK_STARTED,
            SchedulerEvent::TaskCompleted { .. } => topics::TASK_COMPLETED,
            SchedulerEvent::TaskFailed { .. } => topics::TASK_FAILED,
            SchedulerEvent::TaskCancelled { .. } => topics::TASK_CANCELLED,
            SchedulerEvent::TaskTimeout { .. } => topics::TASK_TIMEOUT,
            SchedulerEvent::TaskRequeued { .. } => topics::TASK_REQUEUED,
            SchedulerEvent::WorkerDown { .. } => topics::WORKER_DOWN,
            SchedulerEvent::GpuError { .. } => topics::GPU_ERROR,
            SchedulerEvent::GpuRecovered { .. } => topics::GPU_RECOVERED,
        }
    }

    /// Task the event refers to, if any.
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            SchedulerEvent::TaskQueued { task_id, .. }
            | SchedulerEvent::TaskAssigned { task_id, .. }
            | SchedulerEvent::TaskStarted { task_id, .. }
            | SchedulerEvent::TaskCompleted { task_id, .. }
            | SchedulerEvent::TaskFailed { task_id, .. }
            | SchedulerEvent::TaskCancelled { task_id, .. }
            | SchedulerEvent::TaskTimeout { task_id, .. }
            | SchedulerEvent::TaskRequeued { task_id, .. } => Some(*task_id),
            _ => None,
        }
    }
}
