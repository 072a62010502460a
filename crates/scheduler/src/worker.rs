//! Seam between the scheduler and the external workers that run simulations.
//!
//! The core never waits on a worker. Commands are fire-and-forget; workers
//! answer through `report_started`, `report`, `report_oom` and heartbeats.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use mofsim_core::{GpuId, JobKind, TaskId, WorkerId};

/// Work handed to a worker on placement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Assignment {
    pub task_id: TaskId,
    pub gpu_id: GpuId,
    pub kind: JobKind,
    pub model_id: String,
    pub structure_id: Option<String>,
    pub atom_count: u32,
    pub estimate_bytes: u64,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum WorkerCommand {
    Run(Assignment),
    /// Cooperative stop; the worker acknowledges with a `Cancelled` report.
    Stop { task_id: TaskId },
}

/// Delivers commands to workers. Implementations must not block.
pub trait WorkerControl: Send + Sync {
    fn send(&self, worker_id: &str, command: WorkerCommand);

    fn dispatch(&self, worker_id: &str, assignment: Assignment) {
        self.send(worker_id, WorkerCommand::Run(assignment));
    }

    fn request_stop(&self, worker_id: &str, task_id: TaskId) {
        self.send(worker_id, WorkerCommand::Stop { task_id });
    }
}

/// In-process control plane: one unbounded channel per connected worker.
#[derive(Debug, Default)]
pub struct ChannelWorkerControl {
    senders: RwLock<HashMap<WorkerId, mpsc::UnboundedSender<WorkerCommand>>>,
}

impl ChannelWorkerControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or replace) the command channel for a worker.
    pub fn connect(&self, worker_id: &str) -> mpsc::UnboundedReceiver<WorkerCommand> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(worker_id.to_string(), tx);
        rx
    }

    pub fn disconnect(&self, worker_id: &str) {
        self.senders
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(worker_id);
    }
}

impl WorkerControl for ChannelWorkerControl {
    fn send(&self, worker_id: &str, command: WorkerCommand) {
        let senders = self.senders.read().unwrap_or_else(|e| e.into_inner());
        match senders.get(worker_id) {
            Some(tx) => {
                if tx.send(command).is_err() {
                    warn!(worker_id, "worker channel closed, command dropped");
                } else {
                    debug!(worker_id, "command sent to worker");
                }
            }
            None => warn!(worker_id, "no channel for worker, command dropped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn commands_reach_connected_worker() {
        let control = ChannelWorkerControl::new();
        let mut rx = control.connect("w-0");
        let id = Uuid::new_v4();
        control.request_stop("w-0", id);
        assert_eq!(rx.try_recv().unwrap(), WorkerCommand::Stop { task_id: id });

        control.disconnect("w-0");
        control.request_stop("w-0", id);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn unknown_worker_is_dropped_quietly() {
        let control = ChannelWorkerControl::new();
        control.request_stop("ghost", Uuid::new_v4());
    }
}
