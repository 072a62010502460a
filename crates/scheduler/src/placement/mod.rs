//! Placement scheduler.
//!
//! A repeating tick peeks a bounded window of the queue, estimates each
//! candidate task, scores the feasible GPUs, claims the best one with the
//! registry's compare-and-set and then commits the QUEUED -> ASSIGNED
//! transition. Scoring runs on a possibly stale snapshot; only the final
//! allocate is atomic. Losing a race or finding no capacity just leaves the
//! task queued for a later tick.

pub mod scoring;
mod tick;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;

use mofsim_core::config::{PlacementConfig, ScoringWeights};
use mofsim_core::{GpuId, SchedulerConfig, SharedClock, TaskId, WorkerId};

use crate::estimator::MemoryEstimator;
use crate::health::HealthMonitor;
use crate::lifecycle::LifecycleManager;
use crate::metrics::SchedulerMetrics;
use crate::queue::PriorityQueue;
use crate::registry::GpuRegistry;

/// One committed placement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Placement {
    pub task_id: TaskId,
    pub gpu_id: GpuId,
    pub worker_id: WorkerId,
    pub required_bytes: u64,
    pub score: f64,
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickReport {
    pub placements: Vec<Placement>,
    /// Queue entries evaluated, counting re-evaluations.
    pub examined: usize,
    /// Distinct tasks that were blocked at least once.
    pub deferred: usize,
}

pub struct Scheduler {
    config: PlacementConfig,
    weights: ScoringWeights,
    queue: Arc<PriorityQueue>,
    registry: Arc<GpuRegistry>,
    estimator: Arc<MemoryEstimator>,
    lifecycle: Arc<LifecycleManager>,
    health: Arc<HealthMonitor>,
    metrics: Arc<RwLock<SchedulerMetrics>>,
    /// How many times a blocked urgent task has been overtaken.
    skip_counts: Mutex<HashMap<TaskId, u32>>,
    clock: SharedClock,
}

impl Scheduler {
    pub fn new(
        config: &SchedulerConfig,
        queue: Arc<PriorityQueue>,
        registry: Arc<GpuRegistry>,
        estimator: Arc<MemoryEstimator>,
        lifecycle: Arc<LifecycleManager>,
        health: Arc<HealthMonitor>,
        clock: SharedClock,
    ) -> Self {
        Self {
            config: config.placement.clone(),
            weights: config.scoring.clone(),
            queue,
            registry,
            estimator,
            lifecycle,
            health,
            metrics: Arc::new(RwLock::new(SchedulerMetrics::default())),
            skip_counts: Mutex::new(HashMap::new()),
            clock,
        }
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        self.metrics.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn metrics_handle(&self) -> Arc<RwLock<SchedulerMetrics>> {
        Arc::clone(&self.metrics)
    }

    pub fn skip_count(&self, task_id: &TaskId) -> u32 {
        self.skip_counts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(task_id)
            .copied()
            .unwrap_or(0)
    }
}
