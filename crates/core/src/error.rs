use thiserror::Error;

use crate::types::{GpuId, GpuStatus, TaskId, TaskStatus, WorkerId};

#[derive(Error, Debug)]
pub enum SchedulerError {
    /// Rejected before the task ever reaches PENDING.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("task {task_id} is {status} and cannot be cancelled")]
    NotCancellable { task_id: TaskId, status: TaskStatus },

    #[error("unknown GPU: {0}")]
    UnknownGpu(GpuId),

    #[error("unknown worker: {0}")]
    UnknownWorker(WorkerId),

    #[error("worker {0} is marked dead and must re-register")]
    WorkerDead(WorkerId),

    #[error("transition error: {0}")]
    Transition(#[from] TransitionError),

    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),
}

/// Result of a rejected lifecycle transition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("task not found: {0}")]
    NotFound(TaskId),

    /// Another writer got there first. Internal only: the losing caller
    /// re-reads and decides again.
    #[error("version conflict: expected {expected}, found {actual}")]
    VersionConflict { expected: u64, actual: u64 },

    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: TaskStatus, to: TaskStatus },

    #[error("invalid transition payload: {0}")]
    InvalidPayload(String),
}

/// Result of a rejected GPU allocation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocateError {
    #[error("unknown GPU: {0}")]
    UnknownGpu(GpuId),

    #[error("GPU {gpu_id} already busy with task {current}")]
    AlreadyBusy { gpu_id: GpuId, current: TaskId },

    #[error("GPU {gpu_id} unavailable ({status:?})")]
    Unavailable { gpu_id: GpuId, status: GpuStatus },

    #[error("GPU {gpu_id} needs {required} bytes, only {available} usable")]
    InsufficientMemory {
        gpu_id: GpuId,
        required: u64,
        available: u64,
    },
}

pub type Result<T, E = SchedulerError> = std::result::Result<T, E>;
