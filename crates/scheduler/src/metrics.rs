use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use mofsim_core::GpuId;

/// Placement loop counters exposed to operators.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerMetrics {
    pub ticks: u64,
    /// Queue entries evaluated for placement.
    pub placement_attempts: u64,
    pub placements: u64,
    /// Entries left queued because no GPU fit.
    pub deferrals: u64,
    /// `allocate` lost a compare-and-set race.
    pub allocation_races_lost: u64,
    pub version_conflicts: u64,
    /// Allocations released because the assign transition was rejected.
    pub rollbacks: u64,
    pub placements_by_gpu: HashMap<GpuId, u64>,
    /// Mean time from arrival to assignment.
    pub avg_queue_wait: Duration,
    pub last_tick_at: Option<DateTime<Utc>>,
}

impl SchedulerMetrics {
    pub fn record_placement(&mut self, gpu_id: GpuId, wait: Duration) {
        self.placements += 1;
        *self.placements_by_gpu.entry(gpu_id).or_default() += 1;

        // Incremental mean: new_avg = prev_avg + (wait - prev_avg) / count
        let count = self.placements;
        self.avg_queue_wait = if count == 1 {
            wait
        } else {
            let prev = self.avg_queue_wait.as_nanos() as f64;
            let cur = wait.as_nanos() as f64;
            Duration::from_nanos((prev + (cur - prev) / count as f64) as u64)
        };
    }
}
