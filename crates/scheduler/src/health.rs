//! Worker health monitor.
//!
//! Every worker is bound to one GPU and heartbeats on a fixed cadence.
//! Silence past `suspect_after_secs` makes it SUSPECT (its GPU is withheld
//! from placement until the next heartbeat); silence past
//! `heartbeat_timeout_secs` makes it DEAD. Death is handled exactly once:
//! the GPU goes to ERROR, the bound task fails with `WorkerOffline`, and a
//! `WorkerDown` event is emitted. GPU recovery is left to an operator.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use mofsim_core::config::HealthConfig;
use mofsim_core::{
    GpuId, SchedulerError, SchedulerEvent, SharedClock, TaskId, WorkerId, WorkerStatus,
};

use crate::events::EventBus;
use crate::lifecycle::LifecycleManager;
use crate::registry::GpuRegistry;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerRecord {
    pub worker_id: WorkerId,
    pub gpu_id: GpuId,
    pub status: WorkerStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

/// A worker declared dead by one monitor tick, with what it took down.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerFailure {
    pub worker_id: WorkerId,
    pub gpu_id: GpuId,
    pub last_heartbeat: DateTime<Utc>,
    pub failed_tasks: Vec<TaskId>,
}

pub struct HealthMonitor {
    config: HealthConfig,
    workers: RwLock<HashMap<WorkerId, WorkerRecord>>,
    registry: Arc<GpuRegistry>,
    lifecycle: Arc<LifecycleManager>,
    events: EventBus,
    clock: SharedClock,
}

impl HealthMonitor {
    pub fn new(
        config: HealthConfig,
        registry: Arc<GpuRegistry>,
        lifecycle: Arc<LifecycleManager>,
        events: EventBus,
        clock: SharedClock,
    ) -> Self {
        Self {
            config,
            workers: RwLock::new(HashMap::new()),
            registry,
            lifecycle,
            events,
            clock,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<WorkerId, WorkerRecord>> {
        self.workers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<WorkerId, WorkerRecord>> {
        self.workers.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Bind a worker to a GPU and mark it ALIVE. Re-registering a DEAD
    /// worker is how it comes back. Any other worker bound to the same GPU
    /// is unbound; one that still holds a task is treated as down.
    pub fn register(&self, worker_id: &str, gpu_id: GpuId) -> Result<WorkerRecord, SchedulerError> {
        if self.registry.get(gpu_id).is_none() {
            return Err(SchedulerError::UnknownGpu(gpu_id));
        }
        let now = self.clock.now();
        let record = WorkerRecord {
            worker_id: worker_id.to_string(),
            gpu_id,
            status: WorkerStatus::Alive,
            last_heartbeat: now,
            registered_at: now,
        };
        let displaced: Vec<WorkerRecord> = {
            let mut workers = self.write();
            let displaced: Vec<WorkerRecord> = workers
                .values()
                .filter(|w| (w.gpu_id == gpu_id) != (w.worker_id == worker_id))
                .cloned()
                .collect();
            for old in &displaced {
                workers.remove(&old.worker_id);
                warn!(worker_id = %old.worker_id, gpu_id = old.gpu_id, replaced_by = worker_id, "worker unbound from GPU");
            }
            workers.insert(worker_id.to_string(), record.clone());
            displaced
        };
        for old in displaced {
            self.release_departed(old, now, "was displaced by a new registration");
        }
        info!(worker_id, gpu_id, "worker registered");
        Ok(record)
    }

    pub fn unregister(&self, worker_id: &str) -> Option<WorkerRecord> {
        let removed = self.write().remove(worker_id);
        if let Some(w) = &removed {
            info!(worker_id, gpu_id = w.gpu_id, "worker unregistered");
            self.release_departed(w.clone(), self.clock.now(), "unregistered");
        }
        removed
    }

    /// A worker that left while still holding work goes down the same path
    /// as one that stopped heartbeating.
    fn release_departed(&self, record: WorkerRecord, now: DateTime<Utc>, cause: &str) {
        if record.status == WorkerStatus::Dead || self.lifecycle.tasks_held_by(&record.worker_id).is_empty() {
            return;
        }
        let message = format!("worker {} {cause} while holding a task", record.worker_id);
        self.handle_death(record, message, now);
    }

    /// Record a heartbeat. Timestamps from the future are clamped to now and
    /// never move `last_heartbeat` backwards. A SUSPECT worker is ALIVE again.
    pub fn heartbeat(&self, worker_id: &str, at: Option<DateTime<Utc>>) -> Result<WorkerStatus, SchedulerError> {
        let now = self.clock.now();
        let mut workers = self.write();
        let record = workers
            .get_mut(worker_id)
            .ok_or_else(|| SchedulerError::UnknownWorker(worker_id.to_string()))?;
        if record.status == WorkerStatus::Dead {
            return Err(SchedulerError::WorkerDead(worker_id.to_string()));
        }
        let seen = at.map_or(now, |t| t.min(now));
        record.last_heartbeat = record.last_heartbeat.max(seen);
        if record.status == WorkerStatus::Suspect {
            info!(worker_id, gpu_id = record.gpu_id, "worker alive again");
            record.status = WorkerStatus::Alive;
        }
        debug!(worker_id, "heartbeat");
        Ok(record.status)
    }

    /// Withhold a worker's GPU until it heartbeats again. Used for workers
    /// that ignored a stop or overran a deadline.
    pub fn flag_suspect(&self, worker_id: &str) -> bool {
        let mut workers = self.write();
        match workers.get_mut(worker_id) {
            Some(record) if record.status == WorkerStatus::Alive => {
                warn!(worker_id, gpu_id = record.gpu_id, "worker flagged suspect");
                record.status = WorkerStatus::Suspect;
                true
            }
            _ => false,
        }
    }

    pub fn worker(&self, worker_id: &str) -> Option<WorkerRecord> {
        self.read().get(worker_id).cloned()
    }

    pub fn worker_for_gpu(&self, gpu_id: GpuId) -> Option<WorkerRecord> {
        self.read().values().find(|w| w.gpu_id == gpu_id).cloned()
    }

    /// GPU -> worker for every ALIVE worker. Only these GPUs take new work.
    pub fn alive_bindings(&self) -> HashMap<GpuId, WorkerId> {
        self.read()
            .values()
            .filter(|w| w.status == WorkerStatus::Alive)
            .map(|w| (w.gpu_id, w.worker_id.clone()))
            .collect()
    }

    /// All workers, sorted by id.
    pub fn workers(&self) -> Vec<WorkerRecord> {
        let mut all: Vec<_> = self.read().values().cloned().collect();
        all.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        all
    }

    /// Age every worker's silence. Returns the workers that died on this
    /// tick, after their GPU and task have been dealt with.
    pub fn tick(&self) -> Vec<WorkerFailure> {
        let now = self.clock.now();
        let suspect_after = Duration::seconds(self.config.suspect_after_secs as i64);
        let timeout = Duration::seconds(self.config.heartbeat_timeout_secs as i64);

        let newly_dead: Vec<WorkerRecord> = {
            let mut workers = self.write();
            let mut dead = Vec::new();
            for record in workers.values_mut() {
                if record.status == WorkerStatus::Dead {
                    continue;
                }
                let silence = now - record.last_heartbeat;
                if silence >= timeout {
                    record.status = WorkerStatus::Dead;
                    dead.push(record.clone());
                } else if silence >= suspect_after && record.status == WorkerStatus::Alive {
                    warn!(
                        worker_id = %record.worker_id,
                        gpu_id = record.gpu_id,
                        silent_secs = silence.num_seconds(),
                        "worker missed heartbeats, suspect"
                    );
                    record.status = WorkerStatus::Suspect;
                }
            }
            dead
        };

        newly_dead
            .into_iter()
            .map(|record| {
                let message = format!(
                    "worker {} stopped heartbeating (last seen {})",
                    record.worker_id, record.last_heartbeat
                );
                self.handle_death(record, message, now)
            })
            .collect()
    }

    fn handle_death(&self, record: WorkerRecord, message: String, now: DateTime<Utc>) -> WorkerFailure {
        error!(
            worker_id = %record.worker_id,
            gpu_id = record.gpu_id,
            last_heartbeat = %record.last_heartbeat,
            "worker down"
        );

        // ERROR first, so the GPU is never FREE in between.
        match self.registry.mark_error(record.gpu_id, &message) {
            Ok(true) => self.events.publish(SchedulerEvent::GpuError {
                gpu_id: record.gpu_id,
                message: message.clone(),
                at: now,
            }),
            Ok(false) => {}
            Err(e) => error!(gpu_id = record.gpu_id, error = %e, "could not mark GPU error"),
        }
        let failed_tasks = self.lifecycle.fail_worker_tasks(&record.worker_id, record.gpu_id);
        self.events.publish(SchedulerEvent::WorkerDown {
            worker_id: record.worker_id.clone(),
            gpu_id: record.gpu_id,
            last_heartbeat: record.last_heartbeat,
            at: now,
        });

        WorkerFailure {
            worker_id: record.worker_id,
            gpu_id: record.gpu_id,
            last_heartbeat: record.last_heartbeat,
            failed_tasks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimator::MemoryEstimator;
    use crate::queue::PriorityQueue;
    use crate::worker::ChannelWorkerControl;
    use mofsim_core::config::{EstimatorConfig, GpuSpec, LifecycleConfig, RegistryConfig};
    use mofsim_core::{Clock, GpuStatus, JobKind, ManualClock, Priority, TaskSpec, TaskStatus};

    struct Fixture {
        clock: Arc<ManualClock>,
        registry: Arc<GpuRegistry>,
        lifecycle: Arc<LifecycleManager>,
        events: EventBus,
        monitor: HealthMonitor,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let config = RegistryConfig {
            gpus: vec![GpuSpec::new(0, 24000), GpuSpec::new(3, 24000)],
            ..RegistryConfig::default()
        };
        let registry = Arc::new(GpuRegistry::new(&config, clock.clone()));
        let events = EventBus::new(64);
        let lifecycle = Arc::new(LifecycleManager::new(
            LifecycleConfig::default(),
            Arc::new(PriorityQueue::new()),
            registry.clone(),
            Arc::new(MemoryEstimator::new(EstimatorConfig::default())),
            Arc::new(ChannelWorkerControl::new()),
            events.clone(),
            clock.clone(),
        ));
        let monitor = HealthMonitor::new(
            HealthConfig::default(),
            registry.clone(),
            lifecycle.clone(),
            events.clone(),
            clock.clone(),
        );
        Fixture {
            clock,
            registry,
            lifecycle,
            events,
            monitor,
        }
    }

    #[test]
    fn silence_goes_suspect_then_dead() {
        let f = fixture();
        f.monitor.register("w-0", 0).unwrap();
        f.clock.advance(Duration::seconds(19));
        assert!(f.monitor.tick().is_empty());
        assert_eq!(f.monitor.worker("w-0").unwrap().status, WorkerStatus::Alive);

        f.clock.advance(Duration::seconds(1));
        assert!(f.monitor.tick().is_empty());
        assert_eq!(f.monitor.worker("w-0").unwrap().status, WorkerStatus::Suspect);
        assert!(f.monitor.alive_bindings().is_empty());

        // A heartbeat restores it.
        assert_eq!(f.monitor.heartbeat("w-0", None).unwrap(), WorkerStatus::Alive);
        assert_eq!(f.monitor.alive_bindings()[&0], "w-0");

        f.clock.advance(Duration::seconds(30));
        let dead = f.monitor.tick();
        assert_eq!(dead.len(), 1);
        assert_eq!(f.monitor.worker("w-0").unwrap().status, WorkerStatus::Dead);
        assert_eq!(f.registry.get(0).unwrap().status, GpuStatus::Error);
        // Death is reported once.
        assert!(f.monitor.tick().is_empty());
    }

    #[test]
    fn dead_worker_fails_its_task_and_marks_gpu_error_once() {
        let f = fixture();
        let mut rx = f.events.subscribe();
        f.monitor.register("w-3", 3).unwrap();
        let id = f
            .lifecycle
            .submit(TaskSpec::new(JobKind::Optimization, Priority::High, "orb-v2", 50))
            .unwrap()
            .task_id;
        let task = f.lifecycle.snapshot(&id).unwrap();
        f.registry.allocate(3, id, task.estimate_bytes).unwrap();
        f.lifecycle.assign(id, task.version, 3, "w-3").unwrap();
        f.lifecycle.report_started(id, "w-3").unwrap();

        f.clock.advance(Duration::seconds(30));
        let dead = f.monitor.tick();
        assert_eq!(dead[0].failed_tasks, vec![id]);
        f.monitor.tick();

        let view = f.lifecycle.get_status(&id).unwrap();
        assert_eq!(view.status, TaskStatus::Failed);
        assert_eq!(view.error.unwrap().kind, mofsim_core::ErrorKind::WorkerOffline);
        let gpu = f.registry.get(3).unwrap();
        assert_eq!(gpu.status, GpuStatus::Error);
        assert_eq!(gpu.current_task, None);

        let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        let count = |topic: &str| events.iter().filter(|e| e.topic() == topic).count();
        assert_eq!(count(mofsim_core::topics::TASK_FAILED), 1);
        assert_eq!(count(mofsim_core::topics::GPU_ERROR), 1);
        assert_eq!(count(mofsim_core::topics::WORKER_DOWN), 1);
    }

    #[test]
    fn dead_worker_must_reregister() {
        let f = fixture();
        f.monitor.register("w-0", 0).unwrap();
        f.clock.advance(Duration::seconds(45));
        f.monitor.tick();
        assert!(matches!(
            f.monitor.heartbeat("w-0", None),
            Err(SchedulerError::WorkerDead(_))
        ));
        f.monitor.register("w-0", 0).unwrap();
        assert_eq!(f.monitor.heartbeat("w-0", None).unwrap(), WorkerStatus::Alive);
        assert!(matches!(
            f.monitor.heartbeat("nobody", None),
            Err(SchedulerError::UnknownWorker(_))
        ));
    }

    #[test]
    fn future_heartbeat_is_clamped() {
        let f = fixture();
        f.monitor.register("w-0", 0).unwrap();
        let now = f.clock.now();
        f.monitor
            .heartbeat("w-0", Some(now + Duration::hours(1)))
            .unwrap();
        assert_eq!(f.monitor.worker("w-0").unwrap().last_heartbeat, now);
        f.clock.advance(Duration::seconds(30));
        assert_eq!(f.monitor.tick().len(), 1);
    }

    #[test]
    fn rebinding_a_gpu_replaces_the_old_worker() {
        let f = fixture();
        f.monitor.register("w-old", 0).unwrap();
        f.monitor.register("w-new", 0).unwrap();
        assert!(f.monitor.worker("w-old").is_none());
        assert_eq!(f.monitor.worker_for_gpu(0).unwrap().worker_id, "w-new");
        assert!(matches!(
            f.monitor.register("w-x", 42),
            Err(SchedulerError::UnknownGpu(42))
        ));
        assert!(f.monitor.unregister("w-new").is_some());
        assert!(f.monitor.workers().is_empty());
    }

    fn running_task_on(f: &Fixture, worker_id: &str, gpu_id: GpuId) -> TaskId {
        let id = f
            .lifecycle
            .submit(TaskSpec::new(JobKind::SinglePoint, Priority::Normal, "orb-v2", 40))
            .unwrap()
            .task_id;
        let task = f.lifecycle.snapshot(&id).unwrap();
        f.registry.allocate(gpu_id, id, task.estimate_bytes).unwrap();
        f.lifecycle.assign(id, task.version, gpu_id, worker_id).unwrap();
        f.lifecycle.report_started(id, worker_id).unwrap();
        id
    }

    #[test]
    fn displaced_worker_holding_a_task_goes_down() {
        let f = fixture();
        let mut rx = f.events.subscribe();
        f.monitor.register("w-old", 0).unwrap();
        let id = running_task_on(&f, "w-old", 0);

        f.monitor.register("w-new", 0).unwrap();
        let view = f.lifecycle.get_status(&id).unwrap();
        assert_eq!(view.status, TaskStatus::Failed);
        assert_eq!(view.error.unwrap().kind, mofsim_core::ErrorKind::WorkerOffline);
        let gpu = f.registry.get(0).unwrap();
        assert_eq!(gpu.status, GpuStatus::Error);
        assert_eq!(gpu.current_task, None);
        assert_eq!(f.monitor.worker_for_gpu(0).unwrap().worker_id, "w-new");

        // The new worker keeps heartbeating; nothing is failed twice.
        for _ in 0..10 {
            f.clock.advance(Duration::seconds(10));
            f.monitor.heartbeat("w-new", None).unwrap();
            assert!(f.monitor.tick().is_empty());
        }
        let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        let count = |topic: &str| events.iter().filter(|e| e.topic() == topic).count();
        assert_eq!(count(mofsim_core::topics::TASK_FAILED), 1);
        assert_eq!(count(mofsim_core::topics::WORKER_DOWN), 1);
    }

    #[test]
    fn unregistering_a_busy_worker_fails_its_task() {
        let f = fixture();
        f.monitor.register("w-3", 3).unwrap();
        let id = running_task_on(&f, "w-3", 3);
        assert!(f.monitor.unregister("w-3").is_some());
        assert_eq!(f.lifecycle.get_status(&id).unwrap().status, TaskStatus::Failed);
        assert_eq!(f.registry.get(3).unwrap().status, GpuStatus::Error);

        // An idle worker leaves quietly.
        f.monitor.register("w-0", 0).unwrap();
        f.monitor.unregister("w-0");
        assert_eq!(f.registry.get(0).unwrap().status, GpuStatus::Free);
    }

    #[test]
    fn flagged_worker_is_withheld_until_heartbeat() {
        let f = fixture();
        f.monitor.register("w-0", 0).unwrap();
        assert!(f.monitor.flag_suspect("w-0"));
        assert!(!f.monitor.flag_suspect("w-0"));
        assert!(!f.monitor.alive_bindings().contains_key(&0));
        f.monitor.heartbeat("w-0", None).unwrap();
        assert!(f.monitor.alive_bindings().contains_key(&0));
    }
}
