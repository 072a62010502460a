//! Service facade: builds every component from one config and exposes the
//! external interface (submit, cancel, status, queue/GPU listings, worker
//! reports, telemetry, operator actions, event stream).
//!
//! Three loops drive it: placement, worker health and timeout supervision.
//! Each is a plain synchronous tick, so tests call [`SchedulerService::tick_all`]
//! directly and [`SchedulerService::run`] only adds timers.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use mofsim_core::{
    GpuId, Priority, SchedulerConfig, SchedulerError, SchedulerEvent, SharedClock, SubmitReceipt,
    SystemClock, TaskId, TaskSpec, TaskStatus, TaskView, WorkerStatus,
};

use crate::estimator::{MemoryEstimate, MemoryEstimator};
use crate::events::EventBus;
use crate::health::{HealthMonitor, WorkerFailure, WorkerRecord};
use crate::lifecycle::{CancelOutcome, LifecycleManager, SupervisionReport, TaskOutcome};
use crate::metrics::SchedulerMetrics;
use crate::placement::{Scheduler, TickReport};
use crate::queue::{PriorityQueue, QueueStats};
use crate::registry::{GpuRegistry, GpuSummary, GpuTelemetry, GpuView};
use crate::worker::WorkerControl;

/// Everything one round of the three loops did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServiceTick {
    pub supervision: SupervisionReport,
    pub failures: Vec<WorkerFailure>,
    pub placement: TickReport,
}

/// Operator-facing snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub queue: QueueStats,
    pub gpus: GpuSummary,
    pub tasks: HashMap<TaskStatus, usize>,
    pub workers: usize,
    pub metrics: SchedulerMetrics,
    /// Earliest pending deadline or cancel grace expiry.
    pub next_supervision_due: Option<DateTime<Utc>>,
    pub event_subscribers: usize,
    pub at: DateTime<Utc>,
}

pub struct SchedulerService {
    config: SchedulerConfig,
    clock: SharedClock,
    events: EventBus,
    queue: Arc<PriorityQueue>,
    registry: Arc<GpuRegistry>,
    estimator: Arc<MemoryEstimator>,
    lifecycle: Arc<LifecycleManager>,
    health: Arc<HealthMonitor>,
    scheduler: Scheduler,
}

impl SchedulerService {
    pub fn new(config: SchedulerConfig, workers: Arc<dyn WorkerControl>, clock: SharedClock) -> Self {
        let events = EventBus::new(config.events.capacity);
        let queue = Arc::new(PriorityQueue::new());
        let registry = Arc::new(GpuRegistry::new(&config.registry, clock.clone()));
        let estimator = Arc::new(MemoryEstimator::new(config.estimator.clone()));
        let lifecycle = Arc::new(LifecycleManager::new(
            config.lifecycle.clone(),
            queue.clone(),
            registry.clone(),
            estimator.clone(),
            workers,
            events.clone(),
            clock.clone(),
        ));
        let health = Arc::new(HealthMonitor::new(
            config.health.clone(),
            registry.clone(),
            lifecycle.clone(),
            events.clone(),
            clock.clone(),
        ));
        let scheduler = Scheduler::new(
            &config,
            queue.clone(),
            registry.clone(),
            estimator.clone(),
            lifecycle.clone(),
            health.clone(),
            clock.clone(),
        );
        info!(
            gpus = config.registry.gpus.len(),
            poll_interval_ms = config.placement.poll_interval_ms,
            "scheduler service built"
        );
        Self {
            config,
            clock,
            events,
            queue,
            registry,
            estimator,
            lifecycle,
            health,
            scheduler,
        }
    }

    pub fn with_system_clock(config: SchedulerConfig, workers: Arc<dyn WorkerControl>) -> Self {
        Self::new(config, workers, Arc::new(SystemClock))
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    // ── Task interface ──────────────────────────────────────────────

    pub fn submit(&self, spec: TaskSpec) -> Result<SubmitReceipt, SchedulerError> {
        self.lifecycle.submit(spec)
    }

    pub fn cancel(&self, task_id: TaskId) -> Result<CancelOutcome, SchedulerError> {
        self.lifecycle.cancel(task_id)
    }

    pub fn get_status(&self, task_id: &TaskId) -> Result<TaskView, SchedulerError> {
        self.lifecycle.get_status(task_id)
    }

    pub fn list_tasks(&self, status: Option<TaskStatus>) -> Vec<TaskView> {
        self.lifecycle.list(status)
    }

    pub fn reprioritize(&self, task_id: &TaskId, priority: Priority) -> Result<TaskView, SchedulerError> {
        self.lifecycle.reprioritize(task_id, priority)
    }

    pub fn list_queue(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Estimate without submitting.
    pub fn estimate(&self, spec: &TaskSpec) -> MemoryEstimate {
        self.estimator
            .estimate_detailed(&spec.model_id, spec.atom_count, spec.kind)
    }

    // ── Worker interface ────────────────────────────────────────────

    pub fn register_worker(&self, worker_id: &str, gpu_id: GpuId) -> Result<WorkerRecord, SchedulerError> {
        self.health.register(worker_id, gpu_id)
    }

    pub fn unregister_worker(&self, worker_id: &str) -> Option<WorkerRecord> {
        self.health.unregister(worker_id)
    }

    pub fn heartbeat(&self, worker_id: &str, at: Option<DateTime<Utc>>) -> Result<WorkerStatus, SchedulerError> {
        self.health.heartbeat(worker_id, at)
    }

    pub fn workers(&self) -> Vec<WorkerRecord> {
        self.health.workers()
    }

    pub fn report_started(&self, task_id: TaskId, worker_id: &str) -> Result<TaskView, SchedulerError> {
        self.lifecycle.report_started(task_id, worker_id)
    }

    pub fn report(&self, task_id: TaskId, outcome: TaskOutcome) -> Result<TaskView, SchedulerError> {
        self.lifecycle.report(task_id, outcome)
    }

    pub fn report_oom(&self, task_id: TaskId, model_id: &str) -> Result<TaskView, SchedulerError> {
        self.lifecycle.report_oom(task_id, model_id)
    }

    // ── GPU interface ───────────────────────────────────────────────

    pub fn list_gpus(&self) -> Vec<GpuView> {
        self.registry.list()
    }

    pub fn gpu_summary(&self) -> GpuSummary {
        self.registry.summary()
    }

    pub fn refresh_gpu(&self, gpu_id: GpuId, telemetry: GpuTelemetry) -> Result<(), SchedulerError> {
        self.registry.refresh(gpu_id, telemetry)
    }

    /// Operator action after a driver reset or worker restart.
    pub fn mark_gpu_recovered(&self, gpu_id: GpuId) -> Result<bool, SchedulerError> {
        let recovered = self.registry.mark_recovered(gpu_id)?;
        if recovered {
            self.events.publish(SchedulerEvent::GpuRecovered {
                gpu_id,
                at: self.clock.now(),
            });
        }
        Ok(recovered)
    }

    pub fn set_gpu_maintenance(&self, gpu_id: GpuId, on: bool) -> Result<bool, SchedulerError> {
        self.registry.set_maintenance(gpu_id, on)
    }

    // ── Observability ───────────────────────────────────────────────

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        self.scheduler.metrics()
    }

    /// Live metrics, readable without going through the service.
    pub fn metrics_handle(&self) -> Arc<RwLock<SchedulerMetrics>> {
        self.scheduler.metrics_handle()
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            queue: self.queue.stats(),
            gpus: self.registry.summary(),
            tasks: self.lifecycle.counts(),
            workers: self.health.workers().len(),
            metrics: self.scheduler.metrics(),
            next_supervision_due: self.lifecycle.next_supervision_due(),
            event_subscribers: self.events.subscriber_count(),
            at: self.clock.now(),
        }
    }

    // ── Loops ───────────────────────────────────────────────────────

    pub fn schedule_tick(&self) -> TickReport {
        self.scheduler.tick()
    }

    pub fn monitor_tick(&self) -> Vec<WorkerFailure> {
        self.health.tick()
    }

    /// Fire expired grace windows and deadlines; workers that ignored them
    /// lose their GPU until they heartbeat again.
    pub fn supervise_tick(&self) -> SupervisionReport {
        let report = self.lifecycle.supervise();
        for worker_id in &report.unreliable_workers {
            self.health.flag_suspect(worker_id);
        }
        report
    }

    /// One round of every loop, in dependency order: forced transitions
    /// first so placement sees the freed GPUs.
    pub fn tick_all(&self) -> ServiceTick {
        let supervision = self.supervise_tick();
        let failures = self.monitor_tick();
        let placement = self.schedule_tick();
        ServiceTick {
            supervision,
            failures,
            placement,
        }
    }

    /// Run the three loops on their own intervals until `shutdown` flips to
    /// true (or its sender is dropped).
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let placement = Duration::from_millis(self.config.placement.poll_interval_ms);
        let monitor = Duration::from_millis(self.config.health.monitor_interval_ms);
        let supervisor = Duration::from_millis(self.config.lifecycle.supervisor_interval_ms);
        info!(?placement, ?monitor, ?supervisor, "scheduler loops starting");

        let loops = [
            spawn_loop("placement", placement, shutdown.clone(), {
                let service = Arc::clone(&self);
                move || {
                    service.schedule_tick();
                }
            }),
            spawn_loop("health", monitor, shutdown.clone(), {
                let service = Arc::clone(&self);
                move || {
                    service.monitor_tick();
                }
            }),
            spawn_loop("supervisor", supervisor, shutdown, {
                let service = Arc::clone(&self);
                move || {
                    service.supervise_tick();
                }
            }),
        ];
        for handle in loops {
            if let Err(e) = handle.await {
                warn!(error = %e, "scheduler loop ended abnormally");
            }
        }
        info!("scheduler loops stopped");
    }
}

fn spawn_loop<F>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> tokio::task::JoinHandle<()>
where
    F: FnMut() + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = interval.tick() => tick(),
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!(loop_name = name, "loop shutting down");
    })
}

impl std::fmt::Debug for SchedulerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerService")
            .field("gpus", &self.config.registry.gpus.len())
            .field("queued", &self.queue.len())
            .finish()
    }
}

/// Shared handle used by the daemon and tests.
pub type SharedService = Arc<SchedulerService>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::ChannelWorkerControl;
    use mofsim_core::{JobKind, ManualClock};

    fn service_with(config: SchedulerConfig) -> SharedService {
        let control = Arc::new(ChannelWorkerControl::new());
        Arc::new(SchedulerService::new(
            config,
            control,
            Arc::new(ManualClock::default()),
        ))
    }

    fn service() -> SharedService {
        service_with(SchedulerConfig::default())
    }

    #[test]
    fn tick_all_places_a_submitted_task() {
        let svc = service();
        svc.register_worker("w-0", 0).unwrap();
        let receipt = svc
            .submit(TaskSpec::new(JobKind::Stability, Priority::Normal, "orb-v2", 64))
            .unwrap();
        let tick = svc.tick_all();
        assert_eq!(tick.placement.placements.len(), 1);
        assert_eq!(svc.get_status(&receipt.task_id).unwrap().status, TaskStatus::Assigned);

        let status = svc.status();
        assert_eq!(status.gpus.busy, 1);
        assert_eq!(status.tasks[&TaskStatus::Assigned], 1);
        assert_eq!(status.queue.total, 0);
    }

    #[test]
    fn recovering_a_healthy_gpu_is_a_noop() {
        let svc = service();
        let mut rx = svc.subscribe();
        assert!(!svc.mark_gpu_recovered(0).unwrap());
        assert!(rx.try_recv().is_err());
        assert!(matches!(
            svc.mark_gpu_recovered(7),
            Err(SchedulerError::UnknownGpu(7))
        ));
    }

    #[test]
    fn estimate_matches_submission() {
        let svc = service();
        let spec = TaskSpec::new(JobKind::BulkModulus, Priority::Low, "sevennet-0", 200);
        let estimate = svc.estimate(&spec);
        let receipt = svc.submit(spec).unwrap();
        assert_eq!(
            svc.get_status(&receipt.task_id).unwrap().estimate_bytes,
            estimate.total_bytes
        );
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let mut config = SchedulerConfig::default();
        config.placement.poll_interval_ms = 5;
        let svc = service_with(config);
        let handle = svc.metrics_handle();
        let (tx, rx) = watch::channel(false);
        let running = tokio::spawn(Arc::clone(&svc).run(rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .expect("loops did not stop")
            .unwrap();
        assert!(handle.read().unwrap().ticks >= 1);
    }
}
