use std::collections::{HashMap, HashSet};

use tracing::{debug, info, warn};

use mofsim_core::{AllocateError, GpuId, Task, TaskId, TaskStatus, TransitionError, WorkerId, MB};

use super::{scoring, Placement, Scheduler, TickReport};
use crate::queue::QueueEntry;

/// Result of trying to place one queue entry.
#[derive(Debug)]
pub(super) enum Attempt {
    Placed(Placement),
    /// Still queued; try again on a later tick.
    Blocked,
    /// No longer queued (cancelled or placed elsewhere).
    Gone,
}

impl Scheduler {
    /// Run one placement pass. Places tasks until the window has nothing
    /// placeable or `max_placements_per_tick` is reached.
    ///
    /// Inside the lookahead window a blocked NORMAL/LOW entry stops the
    /// scan, so those classes stay FIFO. A blocked CRITICAL/HIGH entry may
    /// be overtaken, at most `max_skip_count` times when that is set.
    pub fn tick(&self) -> TickReport {
        let bindings = self.health.alive_bindings();
        let mut report = TickReport::default();
        let mut deferred = HashSet::new();

        while report.placements.len() < self.config.max_placements_per_tick {
            let window = self.queue.peek_window(self.config.lookahead);
            if window.is_empty() {
                break;
            }
            let mut overtaken = Vec::new();
            let mut placed = false;

            for entry in &window {
                report.examined += 1;
                match self.try_place(entry, &bindings) {
                    Attempt::Placed(placement) => {
                        self.note_overtaken(&overtaken);
                        deferred.remove(&entry.task_id);
                        report.placements.push(placement);
                        placed = true;
                        break;
                    }
                    Attempt::Gone => continue,
                    Attempt::Blocked => {
                        deferred.insert(entry.task_id);
                        if !entry.priority.is_urgent() {
                            break;
                        }
                        if let Some(max) = self.config.max_skip_count {
                            if self.skip_count(&entry.task_id) >= max {
                                debug!(task_id = %entry.task_id, max, "skip bound reached, holding the window");
                                break;
                            }
                        }
                        overtaken.push(entry.task_id);
                    }
                }
            }
            if !placed {
                break;
            }
        }

        self.forget_dequeued();
        report.deferred = deferred.len();
        let now = self.clock.now();
        let mut metrics = self.metrics.write().unwrap_or_else(|e| e.into_inner());
        metrics.ticks += 1;
        metrics.last_tick_at = Some(now);
        metrics.placement_attempts += report.examined as u64;
        metrics.deferrals += report.deferred as u64;
        report
    }

    fn note_overtaken(&self, overtaken: &[TaskId]) {
        if overtaken.is_empty() {
            return;
        }
        let mut skips = self.skip_counts.lock().unwrap_or_else(|e| e.into_inner());
        for id in overtaken {
            *skips.entry(*id).or_default() += 1;
        }
    }

    /// Skip counts only matter while the task is queued.
    fn forget_dequeued(&self) {
        let mut skips = self.skip_counts.lock().unwrap_or_else(|e| e.into_inner());
        skips.retain(|id, _| self.queue.contains(id));
    }

    fn try_place(&self, entry: &QueueEntry, bindings: &HashMap<GpuId, WorkerId>) -> Attempt {
        match self.lifecycle.snapshot(&entry.task_id) {
            Some(task) if task.status == TaskStatus::Queued => self.place_task(&task, bindings),
            _ => Attempt::Gone,
        }
    }

    /// Score, allocate, assign. `task` is the snapshot the decision is based
    /// on; if it went stale the allocation is rolled back.
    pub(super) fn place_task(&self, task: &Task, bindings: &HashMap<GpuId, WorkerId>) -> Attempt {
        let required = self
            .estimator
            .estimate(&task.model_id, task.atom_count, task.kind)
            .max(task.estimate_bytes);
        let candidates: Vec<_> = self
            .registry
            .candidates(required)
            .into_iter()
            .filter(|gpu| bindings.contains_key(&gpu.id))
            .collect();
        if candidates.is_empty() {
            debug!(task_id = %task.id, required_mb = required / MB, "no feasible GPU, deferred");
            return Attempt::Blocked;
        }

        for (gpu, score) in scoring::rank(candidates, &task.model_id, &self.weights) {
            let Some(worker_id) = bindings.get(&gpu.id) else {
                continue;
            };
            match self.registry.allocate(gpu.id, task.id, required) {
                Ok(()) => {}
                Err(e @ (AllocateError::AlreadyBusy { .. }
                | AllocateError::Unavailable { .. }
                | AllocateError::InsufficientMemory { .. })) => {
                    debug!(task_id = %task.id, gpu_id = gpu.id, error = %e, "allocation lost, trying next GPU");
                    self.metrics
                        .write()
                        .unwrap_or_else(|e| e.into_inner())
                        .allocation_races_lost += 1;
                    continue;
                }
                Err(e) => {
                    warn!(task_id = %task.id, gpu_id = gpu.id, error = %e, "allocation failed");
                    continue;
                }
            }

            return match self.lifecycle.assign(task.id, task.version, gpu.id, worker_id) {
                Ok(_) => {
                    let wait = (self.clock.now() - task.arrival).to_std().unwrap_or_default();
                    self.metrics
                        .write()
                        .unwrap_or_else(|e| e.into_inner())
                        .record_placement(gpu.id, wait);
                    info!(
                        task_id = %task.id,
                        gpu_id = gpu.id,
                        worker_id = %worker_id,
                        priority = %task.priority,
                        required_mb = required / MB,
                        score,
                        "task placed"
                    );
                    Attempt::Placed(Placement {
                        task_id: task.id,
                        gpu_id: gpu.id,
                        worker_id: worker_id.clone(),
                        required_bytes: required,
                        score,
                    })
                }
                Err(e) => self.roll_back(task, gpu.id, e),
            };
        }
        Attempt::Blocked
    }

    /// The assign transition lost (usually to a cancel). Free the GPU and
    /// decide from a fresh read.
    fn roll_back(&self, task: &Task, gpu_id: GpuId, error: TransitionError) -> Attempt {
        self.registry.release_task(gpu_id, &task.id);
        {
            let mut metrics = self.metrics.write().unwrap_or_else(|e| e.into_inner());
            metrics.rollbacks += 1;
            if matches!(error, TransitionError::VersionConflict { .. }) {
                metrics.version_conflicts += 1;
            }
        }
        warn!(task_id = %task.id, gpu_id, error = %error, "assignment rolled back");
        match self.lifecycle.snapshot(&task.id) {
            Some(current) if current.status == TaskStatus::Queued => Attempt::Blocked,
            _ => Attempt::Gone,
        }
    }
}
