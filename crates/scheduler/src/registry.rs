//! GPU resource registry.
//!
//! The pool is fixed at construction. Each GPU sits behind its own mutex, so
//! `allocate` is a compare-and-set on that GPU alone (FREE -> BUSY) and no
//! lock spans more than one GPU. A GPU's `current_task` is `Some` iff its
//! status is BUSY.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use mofsim_core::config::{GpuSpec, RegistryConfig};
use mofsim_core::{AllocateError, GpuId, GpuStatus, SchedulerError, SharedClock, TaskId, MB};

/// Telemetry sample pushed by the external feed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpuTelemetry {
    /// Updated only when the feed reports it.
    #[serde(default)]
    pub total_bytes: Option<u64>,
    pub free_bytes: u64,
    /// Fraction in `[0, 1]`.
    pub utilization: f64,
    pub temperature_c: f64,
}

/// Point-in-time copy of one GPU's state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpuView {
    pub id: GpuId,
    pub name: String,
    pub status: GpuStatus,
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub utilization: f64,
    pub temperature_c: f64,
    /// Most recently used first.
    pub resident_models: Vec<String>,
    pub model_slots_free: usize,
    pub current_task: Option<TaskId>,
    pub error_message: Option<String>,
    pub last_released_at: Option<DateTime<Utc>>,
    pub telemetry_at: Option<DateTime<Utc>>,
}

impl GpuView {
    pub fn has_model(&self, model_id: &str) -> bool {
        self.resident_models.iter().any(|m| m == model_id)
    }
}

/// Aggregate view for dashboards (`listGpus` companion).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GpuSummary {
    pub total: usize,
    pub free: usize,
    pub busy: usize,
    pub error: usize,
    pub maintenance: usize,
    pub total_bytes: u64,
    pub free_bytes: u64,
}

#[derive(Debug)]
struct GpuSlot {
    id: GpuId,
    name: String,
    status: GpuStatus,
    total_bytes: u64,
    free_bytes: u64,
    utilization: f64,
    temperature_c: f64,
    resident_models: LruCache<String, ()>,
    current_task: Option<TaskId>,
    error_message: Option<String>,
    last_released_at: Option<DateTime<Utc>>,
    telemetry_at: Option<DateTime<Utc>>,
}

impl GpuSlot {
    fn from_spec(spec: &GpuSpec, cache_size: NonZeroUsize) -> Self {
        let mut resident_models = LruCache::new(cache_size);
        for model in &spec.resident_models {
            resident_models.put(model.clone(), ());
        }
        Self {
            id: spec.id,
            name: spec
                .name
                .clone()
                .unwrap_or_else(|| format!("GPU {}", spec.id)),
            status: if spec.reserved {
                GpuStatus::Maintenance
            } else {
                GpuStatus::Free
            },
            total_bytes: spec.memory_total_mb * MB,
            free_bytes: spec.memory_free_mb.unwrap_or(spec.memory_total_mb) * MB,
            utilization: 0.0,
            temperature_c: 0.0,
            resident_models,
            current_task: None,
            error_message: None,
            last_released_at: None,
            telemetry_at: None,
        }
    }

    fn view(&self) -> GpuView {
        GpuView {
            id: self.id,
            name: self.name.clone(),
            status: self.status,
            total_bytes: self.total_bytes,
            free_bytes: self.free_bytes,
            utilization: self.utilization,
            temperature_c: self.temperature_c,
            resident_models: self.resident_models.iter().map(|(m, _)| m.clone()).collect(),
            model_slots_free: self.resident_models.cap().get() - self.resident_models.len(),
            current_task: self.current_task,
            error_message: self.error_message.clone(),
            last_released_at: self.last_released_at,
            telemetry_at: self.telemetry_at,
        }
    }
}

pub struct GpuRegistry {
    gpus: BTreeMap<GpuId, Mutex<GpuSlot>>,
    safety_margin_bytes: u64,
    clock: SharedClock,
}

impl GpuRegistry {
    pub fn new(config: &RegistryConfig, clock: SharedClock) -> Self {
        let cache_size = NonZeroUsize::new(config.max_models_per_gpu).unwrap_or(NonZeroUsize::MIN);
        let gpus = config
            .gpus
            .iter()
            .map(|spec| (spec.id, Mutex::new(GpuSlot::from_spec(spec, cache_size))))
            .collect();
        info!(gpu_count = config.gpus.len(), "GPU registry initialized");
        Self {
            gpus,
            safety_margin_bytes: config.safety_margin_bytes(),
            clock,
        }
    }

    fn slot(&self, gpu_id: GpuId) -> Option<MutexGuard<'_, GpuSlot>> {
        self.gpus
            .get(&gpu_id)
            .map(|m| m.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn safety_margin_bytes(&self) -> u64 {
        self.safety_margin_bytes
    }

    /// Whether `required` fits under the safety margin on a GPU with
    /// `free` bytes available.
    pub fn fits(&self, free_bytes: u64, required_bytes: u64) -> bool {
        free_bytes.saturating_sub(self.safety_margin_bytes) >= required_bytes
            && free_bytes >= self.safety_margin_bytes
    }

    /// Largest estimate any GPU in the pool could ever hold.
    pub fn largest_usable_bytes(&self) -> u64 {
        self.list()
            .iter()
            .map(|g| g.total_bytes.saturating_sub(self.safety_margin_bytes))
            .max()
            .unwrap_or(0)
    }

    pub fn get(&self, gpu_id: GpuId) -> Option<GpuView> {
        self.slot(gpu_id).map(|s| s.view())
    }

    /// All GPUs in id order.
    pub fn list(&self) -> Vec<GpuView> {
        self.gpus
            .values()
            .map(|m| m.lock().unwrap_or_else(|e| e.into_inner()).view())
            .collect()
    }

    pub fn free_gpus(&self) -> Vec<GpuView> {
        self.list()
            .into_iter()
            .filter(|g| g.status == GpuStatus::Free)
            .collect()
    }

    /// GPUs with the model resident, whatever their status.
    pub fn gpus_with_model(&self, model_id: &str) -> Vec<GpuView> {
        self.list()
            .into_iter()
            .filter(|g| g.has_model(model_id))
            .collect()
    }

    /// Free GPUs that pass the safety-margin check for `required_bytes`.
    pub fn candidates(&self, required_bytes: u64) -> Vec<GpuView> {
        self.free_gpus()
            .into_iter()
            .filter(|g| self.fits(g.free_bytes, required_bytes))
            .collect()
    }

    /// Atomically claim a FREE GPU for a task. Exactly one concurrent caller
    /// wins; the memory fit is re-checked against live telemetry.
    pub fn allocate(&self, gpu_id: GpuId, task_id: TaskId, required_bytes: u64) -> Result<(), AllocateError> {
        let mut slot = self.slot(gpu_id).ok_or(AllocateError::UnknownGpu(gpu_id))?;
        match slot.status {
            GpuStatus::Free => {}
            GpuStatus::Busy => {
                return Err(AllocateError::AlreadyBusy {
                    gpu_id,
                    current: slot.current_task.unwrap_or_default(),
                })
            }
            status => return Err(AllocateError::Unavailable { gpu_id, status }),
        }
        if !self.fits(slot.free_bytes, required_bytes) {
            return Err(AllocateError::InsufficientMemory {
                gpu_id,
                required: required_bytes,
                available: slot.free_bytes.saturating_sub(self.safety_margin_bytes),
            });
        }
        slot.status = GpuStatus::Busy;
        slot.current_task = Some(task_id);
        info!(gpu_id, task_id = %task_id, required_mb = required_bytes / MB, "GPU allocated");
        Ok(())
    }

    /// Release a GPU unconditionally. Idempotent: releasing a FREE GPU is a
    /// no-op, and ERROR/MAINTENANCE GPUs keep their status.
    pub fn release(&self, gpu_id: GpuId) -> Result<(), SchedulerError> {
        let mut slot = self.slot(gpu_id).ok_or(SchedulerError::UnknownGpu(gpu_id))?;
        if slot.status == GpuStatus::Busy {
            let released = slot.current_task.take();
            slot.status = GpuStatus::Free;
            slot.last_released_at = Some(self.clock.now());
            info!(gpu_id, released_task = ?released, "GPU released");
        }
        Ok(())
    }

    /// Release only if `task_id` still holds the GPU. Returns whether the
    /// GPU was freed by this call.
    pub fn release_task(&self, gpu_id: GpuId, task_id: &TaskId) -> bool {
        let Some(mut slot) = self.slot(gpu_id) else {
            return false;
        };
        if slot.status == GpuStatus::Busy && slot.current_task.as_ref() == Some(task_id) {
            slot.current_task = None;
            slot.status = GpuStatus::Free;
            slot.last_released_at = Some(self.clock.now());
            info!(gpu_id, task_id = %task_id, "GPU released");
            true
        } else {
            debug!(gpu_id, task_id = %task_id, status = ?slot.status, "release skipped, task no longer holds GPU");
            false
        }
    }

    /// Apply a telemetry sample from the external feed.
    pub fn refresh(&self, gpu_id: GpuId, telemetry: GpuTelemetry) -> Result<(), SchedulerError> {
        let mut slot = self.slot(gpu_id).ok_or(SchedulerError::UnknownGpu(gpu_id))?;
        if let Some(total) = telemetry.total_bytes {
            slot.total_bytes = total;
        }
        slot.free_bytes = telemetry.free_bytes.min(slot.total_bytes);
        slot.utilization = telemetry.utilization.clamp(0.0, 1.0);
        slot.temperature_c = telemetry.temperature_c;
        slot.telemetry_at = Some(self.clock.now());
        debug!(
            gpu_id,
            free_mb = slot.free_bytes / MB,
            utilization = slot.utilization,
            temperature_c = slot.temperature_c,
            "GPU telemetry refreshed"
        );
        Ok(())
    }

    /// Put a GPU into ERROR. Any holder is dropped. Returns false if it was
    /// already in ERROR (so callers can emit exactly one event).
    pub fn mark_error(&self, gpu_id: GpuId, message: &str) -> Result<bool, SchedulerError> {
        let mut slot = self.slot(gpu_id).ok_or(SchedulerError::UnknownGpu(gpu_id))?;
        if slot.status == GpuStatus::Error {
            return Ok(false);
        }
        let dropped = slot.current_task.take();
        slot.status = GpuStatus::Error;
        slot.error_message = Some(message.to_string());
        error!(gpu_id, dropped_task = ?dropped, error = message, "GPU marked error");
        Ok(true)
    }

    /// Operator action after a driver reset / process restart: ERROR -> FREE.
    /// Returns false if the GPU was not in ERROR.
    pub fn mark_recovered(&self, gpu_id: GpuId) -> Result<bool, SchedulerError> {
        let mut slot = self.slot(gpu_id).ok_or(SchedulerError::UnknownGpu(gpu_id))?;
        if slot.status != GpuStatus::Error {
            return Ok(false);
        }
        slot.status = GpuStatus::Free;
        slot.error_message = None;
        slot.current_task = None;
        info!(gpu_id, "GPU recovered");
        Ok(true)
    }

    /// Take a FREE GPU out of placement, or return a MAINTENANCE GPU to it.
    pub fn set_maintenance(&self, gpu_id: GpuId, on: bool) -> Result<bool, SchedulerError> {
        let mut slot = self.slot(gpu_id).ok_or(SchedulerError::UnknownGpu(gpu_id))?;
        let changed = match (slot.status, on) {
            (GpuStatus::Free, true) => {
                slot.status = GpuStatus::Maintenance;
                true
            }
            (GpuStatus::Maintenance, false) => {
                slot.status = GpuStatus::Free;
                true
            }
            (status, _) => {
                warn!(gpu_id, ?status, on, "maintenance toggle ignored");
                false
            }
        };
        Ok(changed)
    }

    /// Record that a model is now resident, evicting the least recently used
    /// one if the cache is full. Returns the evicted model.
    pub fn note_model_loaded(&self, gpu_id: GpuId, model_id: &str) -> Option<String> {
        let mut slot = self.slot(gpu_id)?;
        match slot.resident_models.push(model_id.to_string(), ()) {
            Some((evicted, _)) if evicted != model_id => {
                info!(gpu_id, model = %evicted, "model evicted from GPU cache");
                Some(evicted)
            }
            _ => None,
        }
    }

    pub fn summary(&self) -> GpuSummary {
        let mut summary = GpuSummary::default();
        for gpu in self.list() {
            summary.total += 1;
            summary.total_bytes += gpu.total_bytes;
            summary.free_bytes += gpu.free_bytes;
            match gpu.status {
                GpuStatus::Free => summary.free += 1,
                GpuStatus::Busy => summary.busy += 1,
                GpuStatus::Error => summary.error += 1,
                GpuStatus::Maintenance => summary.maintenance += 1,
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use mofsim_core::ManualClock;
    use uuid::Uuid;

    use super::*;

    fn registry(gpus: Vec<GpuSpec>) -> GpuRegistry {
        let config = RegistryConfig {
            gpus,
            ..RegistryConfig::default()
        };
        GpuRegistry::new(&config, Arc::new(ManualClock::default()))
    }

    fn spec(id: GpuId, free_mb: u64, models: &[&str]) -> GpuSpec {
        GpuSpec {
            memory_free_mb: Some(free_mb),
            resident_models: models.iter().map(|m| m.to_string()).collect(),
            ..GpuSpec::new(id, 24000)
        }
    }

    #[test]
    fn allocate_is_exclusive() {
        let reg = registry(vec![spec(0, 20000, &[])]);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        reg.allocate(0, a, 1000 * MB).unwrap();
        assert_eq!(
            reg.allocate(0, b, 1000 * MB),
            Err(AllocateError::AlreadyBusy { gpu_id: 0, current: a })
        );
        let view = reg.get(0).unwrap();
        assert_eq!(view.status, GpuStatus::Busy);
        assert_eq!(view.current_task, Some(a));
    }

    #[test]
    fn concurrent_allocate_has_one_winner() {
        let reg = Arc::new(registry(vec![spec(0, 20000, &[])]));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let reg = Arc::clone(&reg);
                thread::spawn(move || reg.allocate(0, Uuid::new_v4(), MB).is_ok())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn safety_margin_excludes_small_gpu() {
        let reg = registry(vec![spec(2, 3000, &[])]);
        assert!(reg.candidates(5000 * MB).is_empty());
        assert!(matches!(
            reg.allocate(2, Uuid::new_v4(), 5000 * MB),
            Err(AllocateError::InsufficientMemory { .. })
        ));
        // Exactly at the margin boundary: 3000 - 2000 = 1000 usable.
        assert_eq!(reg.candidates(1000 * MB).len(), 1);
        assert!(reg.candidates(1000 * MB + 1).is_empty());
    }

    #[test]
    fn release_is_idempotent() {
        let reg = registry(vec![spec(0, 20000, &[])]);
        let id = Uuid::new_v4();
        reg.allocate(0, id, MB).unwrap();
        reg.release(0).unwrap();
        reg.release(0).unwrap();
        let view = reg.get(0).unwrap();
        assert_eq!(view.status, GpuStatus::Free);
        assert_eq!(view.current_task, None);
        assert!(matches!(reg.release(9), Err(SchedulerError::UnknownGpu(9))));
    }

    #[test]
    fn release_task_ignores_stale_holder() {
        let reg = registry(vec![spec(0, 20000, &[])]);
        let (old, new) = (Uuid::new_v4(), Uuid::new_v4());
        reg.allocate(0, old, MB).unwrap();
        assert!(reg.release_task(0, &old));
        reg.allocate(0, new, MB).unwrap();
        assert!(!reg.release_task(0, &old));
        assert_eq!(reg.get(0).unwrap().current_task, Some(new));
    }

    #[test]
    fn error_clears_holder_and_blocks_allocation() {
        let reg = registry(vec![spec(3, 20000, &[])]);
        let id = Uuid::new_v4();
        reg.allocate(3, id, MB).unwrap();
        assert!(reg.mark_error(3, "worker down").unwrap());
        assert!(!reg.mark_error(3, "worker down").unwrap());
        let view = reg.get(3).unwrap();
        assert_eq!(view.status, GpuStatus::Error);
        assert_eq!(view.current_task, None);
        assert!(!reg.release_task(3, &id));
        assert_eq!(reg.get(3).unwrap().status, GpuStatus::Error);
        assert!(matches!(
            reg.allocate(3, Uuid::new_v4(), MB),
            Err(AllocateError::Unavailable { status: GpuStatus::Error, .. })
        ));
        assert!(reg.mark_recovered(3).unwrap());
        assert_eq!(reg.get(3).unwrap().status, GpuStatus::Free);
        assert!(!reg.mark_recovered(3).unwrap());
    }

    #[test]
    fn model_cache_is_lru_bounded() {
        let reg = registry(vec![spec(0, 20000, &["a"])]);
        assert_eq!(reg.get(0).unwrap().model_slots_free, 1);
        assert_eq!(reg.note_model_loaded(0, "b"), None);
        assert_eq!(reg.get(0).unwrap().model_slots_free, 0);
        // Touch "a" so "b" becomes least recently used.
        assert_eq!(reg.note_model_loaded(0, "a"), None);
        assert_eq!(reg.note_model_loaded(0, "c"), Some("b".to_string()));
        let view = reg.get(0).unwrap();
        assert!(view.has_model("a") && view.has_model("c"));
        assert_eq!(reg.gpus_with_model("b").len(), 0);
        assert_eq!(reg.gpus_with_model("c").len(), 1);
    }

    #[test]
    fn refresh_clamps_telemetry() {
        let reg = registry(vec![spec(0, 20000, &[])]);
        reg.refresh(
            0,
            GpuTelemetry {
                total_bytes: None,
                free_bytes: 99999 * MB,
                utilization: 1.7,
                temperature_c: 65.0,
            },
        )
        .unwrap();
        let view = reg.get(0).unwrap();
        assert_eq!(view.free_bytes, 24000 * MB);
        assert_eq!(view.utilization, 1.0);
        assert!(view.telemetry_at.is_some());
    }

    #[test]
    fn reserved_gpu_starts_in_maintenance() {
        let mut reserved = spec(1, 20000, &[]);
        reserved.reserved = true;
        let reg = registry(vec![spec(0, 20000, &[]), reserved]);
        assert_eq!(reg.free_gpus().len(), 1);
        assert!(reg.set_maintenance(1, false).unwrap());
        assert_eq!(reg.free_gpus().len(), 2);
        let summary = reg.summary();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.free, 2);
    }
}
