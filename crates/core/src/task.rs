use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ErrorKind, GpuId, JobKind, Priority, TaskId, TaskStatus, WorkerId};

/// Submission payload for a new simulation task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub kind: JobKind,
    #[serde(default)]
    pub priority: Priority,
    pub model_id: String,
    /// Structure the job runs on, resolved to `atom_count` by the caller.
    #[serde(default)]
    pub structure_id: Option<String>,
    pub atom_count: u32,
    /// Overrides the per-kind default timeout (capped by config).
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl TaskSpec {
    pub fn new(kind: JobKind, priority: Priority, model_id: impl Into<String>, atom_count: u32) -> Self {
        Self {
            kind,
            priority,
            model_id: model_id.into(),
            structure_id: None,
            atom_count,
            timeout_secs: None,
        }
    }
}

/// Structured failure attached to a task that ended badly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// One entry of a task's status history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub at: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Canonical task record. Only the lifecycle manager writes these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub kind: JobKind,
    pub priority: Priority,
    pub status: TaskStatus,
    pub model_id: String,
    pub structure_id: Option<String>,
    pub atom_count: u32,
    /// Current resource estimate in bytes.
    pub estimate_bytes: u64,
    pub gpu_id: Option<GpuId>,
    pub worker_id: Option<WorkerId>,
    /// Monotonic arrival stamp; queue order within a class.
    pub arrival: DateTime<Utc>,
    /// Tie-break for identical arrival stamps.
    pub arrival_seq: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
    pub timeout_secs: u64,
    pub retry_count: u32,
    pub error: Option<TaskError>,
    pub cancel_requested_at: Option<DateTime<Utc>>,
    pub version: u64,
    pub history: Vec<StatusChange>,
}

impl Task {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Read-only view handed to the scheduler, monitor and external callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskView {
    pub id: TaskId,
    pub kind: JobKind,
    pub priority: Priority,
    pub status: TaskStatus,
    pub model_id: String,
    pub structure_id: Option<String>,
    pub atom_count: u32,
    pub estimate_bytes: u64,
    pub gpu_id: Option<GpuId>,
    pub worker_id: Option<WorkerId>,
    pub arrival: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
    pub timeout_secs: u64,
    pub retry_count: u32,
    pub error: Option<TaskError>,
    pub cancel_requested: bool,
    pub version: u64,
    /// 0-indexed position while QUEUED.
    pub queue_position: Option<usize>,
}

impl From<&Task> for TaskView {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id,
            kind: task.kind,
            priority: task.priority,
            status: task.status,
            model_id: task.model_id.clone(),
            structure_id: task.structure_id.clone(),
            atom_count: task.atom_count,
            estimate_bytes: task.estimate_bytes,
            gpu_id: task.gpu_id,
            worker_id: task.worker_id.clone(),
            arrival: task.arrival,
            started_at: task.started_at,
            completed_at: task.completed_at,
            deadline: task.deadline,
            timeout_secs: task.timeout_secs,
            retry_count: task.retry_count,
            error: task.error.clone(),
            cancel_requested: task.cancel_requested_at.is_some(),
            version: task.version,
            queue_position: None,
        }
    }
}

/// Returned by `submit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub task_id: TaskId,
    pub queue_position: usize,
}
