//! Task lifecycle manager: the single writer of task status.
//!
//! Every status change goes through [`LifecycleManager::transition`], which
//! checks the caller's observed version, the transition table in [`fsm`] and
//! the payload before touching anything. A rejected transition leaves the
//! task record untouched.
//!
//! Lock order: task store, then queue, then a GPU slot, then the supervisor.
//! Only the task store lock is ever held while taking another. Events are
//! published after the store lock is released.

mod cancel;
pub mod fsm;
mod reports;
mod supervisor;
mod transition;


use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use mofsim_core::config::LifecycleConfig;
use mofsim_core::{
    Priority, SchedulerError, SharedClock, SubmitReceipt, Task, TaskId, TaskSpec, TaskStatus,
    TaskView, TransitionError, MB,
};

use crate::estimator::MemoryEstimator;
use crate::events::EventBus;
use crate::queue::PriorityQueue;
use crate::registry::GpuRegistry;
use crate::worker::WorkerControl;

pub use cancel::CancelOutcome;
pub use reports::TaskOutcome;
pub use supervisor::SupervisionReport;
pub use transition::TransitionPayload;

use supervisor::Supervisor;

/// Bound on read-decide-write retries after a version conflict.
const MAX_CONFLICT_RETRIES: usize = 8;

/// Last issued arrival stamp. Arrivals never go backwards even if the
/// clock does.
#[derive(Debug)]
struct ArrivalStamp {
    last: DateTime<Utc>,
    seq: u64,
}

pub struct LifecycleManager {
    config: LifecycleConfig,
    tasks: RwLock<HashMap<TaskId, Task>>,
    queue: Arc<PriorityQueue>,
    registry: Arc<GpuRegistry>,
    estimator: Arc<MemoryEstimator>,
    workers: Arc<dyn WorkerControl>,
    events: EventBus,
    clock: SharedClock,
    arrival: Mutex<ArrivalStamp>,
    supervisor: Mutex<Supervisor>,
}

impl LifecycleManager {
    pub fn new(
        config: LifecycleConfig,
        queue: Arc<PriorityQueue>,
        registry: Arc<GpuRegistry>,
        estimator: Arc<MemoryEstimator>,
        workers: Arc<dyn WorkerControl>,
        events: EventBus,
        clock: SharedClock,
    ) -> Self {
        let start = clock.now();
        Self {
            config,
            tasks: RwLock::new(HashMap::new()),
            queue,
            registry,
            estimator,
            workers,
            events,
            clock,
            arrival: Mutex::new(ArrivalStamp { last: start, seq: 0 }),
            supervisor: Mutex::new(Supervisor::default()),
        }
    }

    fn read_tasks(&self) -> RwLockReadGuard<'_, HashMap<TaskId, Task>> {
        self.tasks.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_tasks(&self) -> RwLockWriteGuard<'_, HashMap<TaskId, Task>> {
        self.tasks.write().unwrap_or_else(|e| e.into_inner())
    }

    fn next_arrival(&self) -> (DateTime<Utc>, u64) {
        let now = self.clock.now();
        let mut stamp = self.arrival.lock().unwrap_or_else(|e| e.into_inner());
        stamp.last = stamp.last.max(now);
        stamp.seq += 1;
        (stamp.last, stamp.seq)
    }

    /// Validate a submission and return its memory estimate.
    fn validate(&self, spec: &TaskSpec) -> Result<u64, SchedulerError> {
        if spec.model_id.trim().is_empty() {
            return Err(SchedulerError::Validation("model_id must not be empty".into()));
        }
        if spec.atom_count == 0 {
            return Err(SchedulerError::Validation("atom_count must be positive".into()));
        }
        if spec.timeout_secs == Some(0) {
            return Err(SchedulerError::Validation("timeout_secs must be positive".into()));
        }
        let estimate = self.estimator.estimate(&spec.model_id, spec.atom_count, spec.kind);
        let largest = self.registry.largest_usable_bytes();
        if estimate > largest {
            return Err(SchedulerError::Validation(format!(
                "estimated {} MB exceeds the largest GPU's usable {} MB",
                estimate / MB,
                largest / MB
            )));
        }
        Ok(estimate)
    }

    /// Accept a task: PENDING, then straight into the queue.
    pub fn submit(&self, spec: TaskSpec) -> Result<SubmitReceipt, SchedulerError> {
        let estimate_bytes = self.validate(&spec)?;
        let (arrival, arrival_seq) = self.next_arrival();
        let id = Uuid::new_v4();
        let task = Task {
            id,
            kind: spec.kind,
            priority: spec.priority,
            status: TaskStatus::Pending,
            model_id: spec.model_id,
            structure_id: spec.structure_id,
            atom_count: spec.atom_count,
            estimate_bytes,
            gpu_id: None,
            worker_id: None,
            arrival,
            arrival_seq,
            created_at: self.clock.now(),
            started_at: None,
            completed_at: None,
            deadline: None,
            timeout_secs: self.config.timeout_for(spec.kind, spec.timeout_secs),
            retry_count: 0,
            error: None,
            cancel_requested_at: None,
            version: 0,
            history: Vec::new(),
        };

        let (applied, queue_position) = {
            let mut tasks = self.write_tasks();
            tasks.insert(id, task);
            let applied = self.apply(
                &mut tasks,
                id,
                0,
                TaskStatus::Queued,
                TransitionPayload::default().with_reason("submitted"),
            )?;
            (applied, self.queue.position(&id).unwrap_or(0))
        };
        info!(
            task_id = %id,
            kind = %applied.view.kind,
            priority = %applied.view.priority,
            model = %applied.view.model_id,
            estimate_mb = estimate_bytes / MB,
            queue_position,
            "task submitted"
        );
        self.events.publish_all(applied.events);
        Ok(SubmitReceipt {
            task_id: id,
            queue_position,
        })
    }

    /// Full task record, including history.
    pub fn snapshot(&self, id: &TaskId) -> Option<Task> {
        self.read_tasks().get(id).cloned()
    }

    pub fn get_status(&self, id: &TaskId) -> Result<TaskView, SchedulerError> {
        let tasks = self.read_tasks();
        let task = tasks.get(id).ok_or(SchedulerError::TaskNotFound(*id))?;
        Ok(self.view_of(task))
    }

    fn view_of(&self, task: &Task) -> TaskView {
        let mut view = TaskView::from(task);
        if task.status == TaskStatus::Queued {
            view.queue_position = self.queue.position(&task.id);
        }
        view
    }

    /// All tasks, optionally filtered by status, oldest arrival first.
    pub fn list(&self, status: Option<TaskStatus>) -> Vec<TaskView> {
        let tasks = self.read_tasks();
        let mut views: Vec<_> = tasks
            .values()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .map(|t| self.view_of(t))
            .collect();
        views.sort_by_key(|v| (v.arrival, v.id));
        views
    }

    /// Task counts by status.
    pub fn counts(&self) -> HashMap<TaskStatus, usize> {
        let mut counts = HashMap::new();
        for task in self.read_tasks().values() {
            *counts.entry(task.status).or_default() += 1;
        }
        counts
    }

    /// Change the class of a QUEUED task. Arrival is kept, so the task lands
    /// in the new class at the position its original arrival earns it.
    pub fn reprioritize(&self, id: &TaskId, priority: Priority) -> Result<TaskView, SchedulerError> {
        let mut tasks = self.write_tasks();
        let task = tasks.get_mut(id).ok_or(SchedulerError::TaskNotFound(*id))?;
        if task.status != TaskStatus::Queued {
            return Err(SchedulerError::Validation(format!(
                "task {id} is {}; only queued tasks can be reprioritized",
                task.status
            )));
        }
        if task.priority != priority {
            let old = task.priority;
            task.priority = priority;
            task.version += 1;
            self.queue.reprioritize(id, priority);
            debug!(task_id = %id, %old, new = %priority, version = task.version, "priority changed");
        }
        let task = &*task;
        Ok(self.view_of(task))
    }

    /// Read-decide-write loop. `decide` sees the current record and returns
    /// the transition to attempt, or `None` to leave the task alone. Version
    /// conflicts re-read and decide again.
    fn transition_with<F>(&self, id: TaskId, mut decide: F) -> Result<Option<TaskView>, TransitionError>
    where
        F: FnMut(&Task) -> Option<(TaskStatus, TransitionPayload)>,
    {
        let mut last_conflict = None;
        for _ in 0..MAX_CONFLICT_RETRIES {
            let task = self.snapshot(&id).ok_or(TransitionError::NotFound(id))?;
            let Some((to, payload)) = decide(&task) else {
                return Ok(None);
            };
            match self.transition(id, task.version, to, payload) {
                Err(conflict @ TransitionError::VersionConflict { .. }) => {
                    debug!(task_id = %id, "version conflict, re-reading");
                    last_conflict = Some(conflict);
                }
                other => return other.map(Some),
            }
        }
        Err(last_conflict.unwrap_or(TransitionError::NotFound(id)))
    }
}
