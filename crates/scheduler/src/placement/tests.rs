use std::collections::HashSet;
use std::sync::Arc;

use mofsim_core::config::{GpuSpec, PlacementConfig, RegistryConfig};
use mofsim_core::{
    GpuStatus, JobKind, ManualClock, Priority, SchedulerConfig, TaskId, TaskSpec, TaskStatus, MB,
};

use super::*;
use crate::events::EventBus;
use crate::worker::ChannelWorkerControl;

struct Fixture {
    registry: Arc<GpuRegistry>,
    lifecycle: Arc<LifecycleManager>,
    health: Arc<HealthMonitor>,
    queue: Arc<PriorityQueue>,
    scheduler: Scheduler,
}

fn gpu(id: GpuId, free_mb: u64, models: &[&str]) -> GpuSpec {
    GpuSpec {
        memory_free_mb: Some(free_mb),
        resident_models: models.iter().map(|m| m.to_string()).collect(),
        ..GpuSpec::new(id, 24000)
    }
}

fn setup(gpus: Vec<GpuSpec>, placement: PlacementConfig) -> Fixture {
    let mut config = SchedulerConfig {
        placement,
        registry: RegistryConfig {
            gpus: gpus.clone(),
            ..RegistryConfig::default()
        },
        ..SchedulerConfig::default()
    };
    config.estimator.models.insert("mace_prod".into(), 4000);

    let clock = Arc::new(ManualClock::default());
    let queue = Arc::new(PriorityQueue::new());
    let registry = Arc::new(GpuRegistry::new(&config.registry, clock.clone()));
    let estimator = Arc::new(MemoryEstimator::new(config.estimator.clone()));
    let events = EventBus::new(256);
    let lifecycle = Arc::new(LifecycleManager::new(
        config.lifecycle.clone(),
        queue.clone(),
        registry.clone(),
        estimator.clone(),
        Arc::new(ChannelWorkerControl::new()),
        events.clone(),
        clock.clone(),
    ));
    let health = Arc::new(HealthMonitor::new(
        config.health.clone(),
        registry.clone(),
        lifecycle.clone(),
        events,
        clock.clone(),
    ));
    for spec in &gpus {
        health.register(&format!("w-{}", spec.id), spec.id).unwrap();
    }
    let scheduler = Scheduler::new(
        &config,
        queue.clone(),
        registry.clone(),
        estimator,
        lifecycle.clone(),
        health.clone(),
        clock,
    );
    Fixture {
        registry,
        lifecycle,
        health,
        queue,
        scheduler,
    }
}

impl Fixture {
    fn submit(&self, priority: Priority, model: &str, atoms: u32) -> TaskId {
        self.lifecycle
            .submit(TaskSpec::new(JobKind::SinglePoint, priority, model, atoms))
            .unwrap()
            .task_id
    }

    /// 3200 MB
    fn small(&self, priority: Priority) -> TaskId {
        self.submit(priority, "orb-v2", 100)
    }

    /// 10000 MB
    fn big(&self, priority: Priority) -> TaskId {
        self.submit(priority, "mace-mp-0-large", 1000)
    }

    fn status(&self, id: &TaskId) -> TaskStatus {
        self.lifecycle.get_status(id).unwrap().status
    }
}

#[test]
fn resident_model_wins_placement() {
    let f = setup(
        vec![gpu(0, 20000, &["mace_prod"]), gpu(1, 15000, &[])],
        PlacementConfig::default(),
    );
    // (4000 + 500 * 2) * 1.0 = 5000 MB
    let id = f.submit(Priority::Normal, "mace_prod", 500);
    assert_eq!(f.lifecycle.get_status(&id).unwrap().estimate_bytes, 5000 * MB);
    assert_eq!(f.registry.candidates(5000 * MB).len(), 2);

    let report = f.scheduler.tick();
    assert_eq!(report.placements.len(), 1);
    assert_eq!(report.placements[0].gpu_id, 0);
    let view = f.lifecycle.get_status(&id).unwrap();
    assert_eq!(view.status, TaskStatus::Assigned);
    assert_eq!(view.gpu_id, Some(0));
    assert_eq!(view.worker_id.as_deref(), Some("w-0"));
    assert_eq!(f.registry.get(0).unwrap().current_task, Some(id));
}

#[test]
fn gpu_below_margin_leaves_task_queued() {
    let f = setup(vec![gpu(2, 3000, &[])], PlacementConfig::default());
    // (4000 + 500 * 2) MB against 3000 - 2000 usable.
    let id = f.submit(Priority::High, "mace_prod", 500);
    let report = f.scheduler.tick();
    assert!(report.placements.is_empty());
    assert_eq!(report.deferred, 1);
    assert_eq!(f.status(&id), TaskStatus::Queued);
    assert_eq!(f.registry.get(2).unwrap().status, GpuStatus::Free);
    assert_eq!(f.scheduler.metrics().deferrals, 1);
}

#[test]
fn gpus_without_alive_worker_are_skipped() {
    let f = setup(vec![gpu(0, 20000, &[]), gpu(1, 20000, &[])], PlacementConfig::default());
    f.health.unregister("w-0");
    f.health.flag_suspect("w-1");
    let id = f.small(Priority::Critical);
    assert!(f.scheduler.tick().placements.is_empty());

    f.health.heartbeat("w-1", None).unwrap();
    let report = f.scheduler.tick();
    assert_eq!(report.placements[0].gpu_id, 1);
    assert_eq!(f.status(&id), TaskStatus::Assigned);
}

#[test]
fn higher_class_is_placed_first() {
    let f = setup(vec![gpu(0, 20000, &[])], PlacementConfig::default());
    let normal = f.small(Priority::Normal);
    let critical = f.small(Priority::Critical);
    let report = f.scheduler.tick();
    assert_eq!(report.placements.len(), 1);
    assert_eq!(report.placements[0].task_id, critical);
    assert_eq!(f.status(&normal), TaskStatus::Queued);
}

#[test]
fn blocked_urgent_task_can_be_overtaken() {
    let f = setup(vec![gpu(0, 10000, &[])], PlacementConfig::default());
    let high = f.big(Priority::High);
    let normal = f.small(Priority::Normal);

    let report = f.scheduler.tick();
    assert_eq!(report.placements.len(), 1);
    assert_eq!(report.placements[0].task_id, normal);
    assert_eq!(f.status(&high), TaskStatus::Queued);
    assert_eq!(f.scheduler.skip_count(&high), 1);
}

#[test]
fn blocked_normal_task_holds_its_class() {
    let f = setup(vec![gpu(0, 10000, &[])], PlacementConfig::default());
    let normal = f.big(Priority::Normal);
    let low = f.small(Priority::Low);

    let report = f.scheduler.tick();
    assert!(report.placements.is_empty());
    assert_eq!(f.status(&normal), TaskStatus::Queued);
    assert_eq!(f.status(&low), TaskStatus::Queued);
}

#[test]
fn skip_bound_stops_overtaking() {
    let placement = PlacementConfig {
        max_skip_count: Some(1),
        ..PlacementConfig::default()
    };
    let f = setup(vec![gpu(0, 10000, &[]), gpu(1, 10000, &[])], placement);
    let high = f.big(Priority::High);
    let first = f.small(Priority::Normal);
    let second = f.small(Priority::Normal);

    let report = f.scheduler.tick();
    assert_eq!(report.placements.len(), 1);
    assert_eq!(f.status(&first), TaskStatus::Assigned);
    assert_eq!(f.status(&second), TaskStatus::Queued);
    assert_eq!(f.scheduler.skip_count(&high), 1);

    assert!(f.scheduler.tick().placements.is_empty());
    assert_eq!(f.status(&second), TaskStatus::Queued);
}

#[test]
fn skip_counts_are_dropped_once_dequeued() {
    let f = setup(vec![gpu(0, 10000, &[])], PlacementConfig::default());
    let high = f.big(Priority::High);
    f.small(Priority::Normal);
    f.scheduler.tick();
    assert_eq!(f.scheduler.skip_count(&high), 1);
    f.lifecycle.cancel(high).unwrap();
    f.scheduler.tick();
    assert_eq!(f.scheduler.skip_count(&high), 0);
}

#[test]
fn stale_snapshot_rolls_back_allocation() {
    let f = setup(vec![gpu(0, 20000, &[])], PlacementConfig::default());
    let id = f.small(Priority::Normal);
    let stale = f.lifecycle.snapshot(&id).unwrap();
    f.lifecycle.cancel(id).unwrap();

    let bindings = f.health.alive_bindings();
    assert!(matches!(
        f.scheduler.place_task(&stale, &bindings),
        tick::Attempt::Gone
    ));
    let gpu = f.registry.get(0).unwrap();
    assert_eq!(gpu.status, GpuStatus::Free);
    assert_eq!(gpu.current_task, None);
    assert_eq!(f.status(&id), TaskStatus::Cancelled);

    let metrics = f.scheduler.metrics();
    assert_eq!(metrics.rollbacks, 1);
    assert_eq!(metrics.version_conflicts, 1);
}

#[test]
fn one_tick_fills_every_gpu_once() {
    let f = setup(
        vec![gpu(0, 20000, &[]), gpu(1, 20000, &[]), gpu(2, 20000, &[])],
        PlacementConfig::default(),
    );
    let ids: Vec<_> = (0..5).map(|_| f.small(Priority::Normal)).collect();
    let report = f.scheduler.tick();
    assert_eq!(report.placements.len(), 3);

    let gpus: HashSet<_> = report.placements.iter().map(|p| p.gpu_id).collect();
    assert_eq!(gpus.len(), 3);
    // FIFO within the class.
    let placed: Vec<_> = report.placements.iter().map(|p| p.task_id).collect();
    assert_eq!(placed, ids[..3].to_vec());
    assert_eq!(f.queue.len(), 2);
    assert_eq!(f.registry.summary().busy, 3);
    assert_eq!(f.scheduler.metrics().placements, 3);
}

#[test]
fn placements_per_tick_are_capped() {
    let placement = PlacementConfig {
        max_placements_per_tick: 1,
        ..PlacementConfig::default()
    };
    let f = setup(vec![gpu(0, 20000, &[]), gpu(1, 20000, &[])], placement);
    f.small(Priority::Normal);
    f.small(Priority::Normal);
    assert_eq!(f.scheduler.tick().placements.len(), 1);
    assert_eq!(f.scheduler.tick().placements.len(), 1);
    assert_eq!(f.scheduler.metrics().ticks, 2);
}

#[test]
fn empty_queue_tick_is_a_noop() {
    let f = setup(vec![gpu(0, 20000, &[])], PlacementConfig::default());
    let report = f.scheduler.tick();
    assert_eq!(report, TickReport::default());
    assert_eq!(f.scheduler.metrics().ticks, 1);
}
