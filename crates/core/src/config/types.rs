use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{GpuId, JobKind, MB};

// ── Top-level config ────────────────────────────────────────────────

/// Full scheduler configuration.
///
/// Parsed from `scheduler.toml` with support for `MOFSIM_*` environment
/// variable overrides. Every section and field has a default, so an empty
/// document is a valid (single mock GPU) configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub placement: PlacementConfig,

    #[serde(default)]
    pub scoring: ScoringWeights,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub estimator: EstimatorConfig,

    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub events: EventsConfig,
}

// ── Placement ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementConfig {
    /// Scheduler tick interval.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How many queue entries a tick may inspect past a blocked head.
    #[serde(default = "default_lookahead")]
    pub lookahead: usize,
    /// How often a blocked CRITICAL/HIGH entry may be overtaken before it
    /// blocks the window. `None` = unbounded.
    #[serde(default)]
    pub max_skip_count: Option<u32>,
    #[serde(default = "default_max_placements_per_tick")]
    pub max_placements_per_tick: usize,
}

fn default_poll_interval_ms() -> u64 { 100 }
fn default_lookahead() -> usize { 8 }
fn default_max_placements_per_tick() -> usize { 16 }

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            lookahead: default_lookahead(),
            max_skip_count: None,
            max_placements_per_tick: default_max_placements_per_tick(),
        }
    }
}

/// GPU scoring weights. Tunable heuristics, not a contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringWeights {
    #[serde(default = "default_affinity_weight")]
    pub affinity: f64,
    #[serde(default = "default_memory_weight")]
    pub memory: f64,
    #[serde(default = "default_utilization_weight")]
    pub utilization: f64,
    #[serde(default = "default_temperature_weight")]
    pub temperature: f64,
    /// Affinity credit for a GPU with a spare model-cache slot.
    #[serde(default = "default_spare_slot_affinity")]
    pub spare_slot_affinity: f64,
    /// Temperature that scores zero on the thermal term.
    #[serde(default = "default_max_temperature_c")]
    pub max_temperature_c: f64,
}

fn default_affinity_weight() -> f64 { 100.0 }
fn default_memory_weight() -> f64 { 40.0 }
fn default_utilization_weight() -> f64 { 30.0 }
fn default_temperature_weight() -> f64 { 20.0 }
fn default_spare_slot_affinity() -> f64 { 0.5 }
fn default_max_temperature_c() -> f64 { 100.0 }

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            affinity: default_affinity_weight(),
            memory: default_memory_weight(),
            utilization: default_utilization_weight(),
            temperature: default_temperature_weight(),
            spare_slot_affinity: default_spare_slot_affinity(),
            max_temperature_c: default_max_temperature_c(),
        }
    }
}

// ── Registry ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Headroom kept free on every GPU regardless of task.
    #[serde(default = "default_safety_margin_mb")]
    pub safety_margin_mb: u64,
    /// Resident model cache size per GPU.
    #[serde(default = "default_max_models_per_gpu")]
    pub max_models_per_gpu: usize,
    /// GPU inventory. The pool is fixed for the process lifetime.
    #[serde(default = "default_gpus")]
    pub gpus: Vec<GpuSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuSpec {
    pub id: GpuId,
    #[serde(default)]
    pub name: Option<String>,
    pub memory_total_mb: u64,
    /// Initial free memory; defaults to the total.
    #[serde(default)]
    pub memory_free_mb: Option<u64>,
    /// Models already resident at startup.
    #[serde(default)]
    pub resident_models: Vec<String>,
    /// Start in MAINTENANCE (excluded from placement).
    #[serde(default)]
    pub reserved: bool,
}

impl GpuSpec {
    pub fn new(id: GpuId, memory_total_mb: u64) -> Self {
        Self {
            id,
            name: None,
            memory_total_mb,
            memory_free_mb: None,
            resident_models: Vec::new(),
            reserved: false,
        }
    }
}

fn default_safety_margin_mb() -> u64 { 2000 }
fn default_max_models_per_gpu() -> usize { 2 }
fn default_gpus() -> Vec<GpuSpec> {
    vec![GpuSpec {
        id: 0,
        name: Some("Mock GPU 0".into()),
        memory_total_mb: 24000,
        memory_free_mb: Some(22000),
        resident_models: Vec::new(),
        reserved: false,
    }]
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            safety_margin_mb: default_safety_margin_mb(),
            max_models_per_gpu: default_max_models_per_gpu(),
            gpus: default_gpus(),
        }
    }
}

impl RegistryConfig {
    pub fn safety_margin_bytes(&self) -> u64 {
        self.safety_margin_mb * MB
    }
}

// ── Estimator ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstimatorConfig {
    /// Base cost for models missing from `models`.
    #[serde(default = "default_model_mb")]
    pub default_model_mb: u64,
    #[serde(default = "default_per_atom_mb")]
    pub per_atom_mb: u64,
    /// Applied to a model's base cost on every out-of-memory report.
    #[serde(default = "default_oom_growth_factor")]
    pub oom_growth_factor: f64,
    /// Model id -> base cost in MB.
    #[serde(default = "default_model_table")]
    pub models: BTreeMap<String, u64>,
    #[serde(default = "default_multipliers")]
    pub multipliers: BTreeMap<JobKind, f64>,
}

fn default_model_mb() -> u64 { 4000 }
fn default_per_atom_mb() -> u64 { 2 }
fn default_oom_growth_factor() -> f64 { 1.2 }

fn default_model_table() -> BTreeMap<String, u64> {
    [
        ("mace-mp-0-medium", 4000),
        ("mace-mp-0-large", 8000),
        ("mace-omat-0-medium", 5000),
        ("mace-omat-0-large", 10000),
        ("orb-v2", 3000),
        ("sevennet-0", 3500),
        ("mattersim-v1-1m", 4000),
        ("mattersim-v1-5m", 8000),
        ("grace-2l-oam", 4500),
    ]
    .into_iter()
    .map(|(name, mb)| (name.to_string(), mb))
    .collect()
}

fn default_multipliers() -> BTreeMap<JobKind, f64> {
    BTreeMap::from([
        (JobKind::Optimization, 1.2),
        (JobKind::Stability, 1.5),
        (JobKind::BulkModulus, 1.3),
        (JobKind::HeatCapacity, 2.0),
        (JobKind::InteractionEnergy, 1.2),
        (JobKind::SinglePoint, 1.0),
    ])
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            default_model_mb: default_model_mb(),
            per_atom_mb: default_per_atom_mb(),
            oom_growth_factor: default_oom_growth_factor(),
            models: default_model_table(),
            multipliers: default_multipliers(),
        }
    }
}

impl EstimatorConfig {
    pub fn multiplier_for(&self, kind: JobKind) -> f64 {
        self.multipliers.get(&kind).copied().unwrap_or(1.0)
    }
}

// ── Lifecycle ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// How long a worker has to acknowledge a stop request.
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Upper bound for caller-supplied timeouts.
    #[serde(default = "default_max_timeout_secs")]
    pub max_timeout_secs: u64,
    #[serde(default = "default_kind_timeouts")]
    pub timeouts: BTreeMap<JobKind, u64>,
    /// Automatic requeues granted after out-of-memory reports.
    #[serde(default = "default_max_oom_retries")]
    pub max_oom_retries: u32,
    /// Timeout supervisor tick interval.
    #[serde(default = "default_supervisor_interval_ms")]
    pub supervisor_interval_ms: u64,
}

fn default_cancel_grace_secs() -> u64 { 30 }
fn default_timeout_secs() -> u64 { 3600 }
fn default_max_timeout_secs() -> u64 { 86400 }
fn default_max_oom_retries() -> u32 { 1 }
fn default_supervisor_interval_ms() -> u64 { 1000 }

fn default_kind_timeouts() -> BTreeMap<JobKind, u64> {
    BTreeMap::from([
        (JobKind::Optimization, 1800),
        (JobKind::Stability, 7200),
        (JobKind::BulkModulus, 3600),
        (JobKind::HeatCapacity, 7200),
        (JobKind::InteractionEnergy, 1800),
        (JobKind::SinglePoint, 600),
    ])
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            cancel_grace_secs: default_cancel_grace_secs(),
            default_timeout_secs: default_timeout_secs(),
            max_timeout_secs: default_max_timeout_secs(),
            timeouts: default_kind_timeouts(),
            max_oom_retries: default_max_oom_retries(),
            supervisor_interval_ms: default_supervisor_interval_ms(),
        }
    }
}

impl LifecycleConfig {
    /// Effective timeout: a custom value wins but is capped.
    pub fn timeout_for(&self, kind: JobKind, custom_secs: Option<u64>) -> u64 {
        match custom_secs {
            Some(secs) => secs.min(self.max_timeout_secs),
            None => self
                .timeouts
                .get(&kind)
                .copied()
                .unwrap_or(self.default_timeout_secs),
        }
    }
}

// ── Health ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Expected heartbeat cadence of every worker.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Silence after which a worker is SUSPECT and its GPU withheld.
    #[serde(default = "default_suspect_after_secs")]
    pub suspect_after_secs: u64,
    /// Silence after which a worker is DEAD.
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,
}

fn default_heartbeat_interval_secs() -> u64 { 10 }
fn default_suspect_after_secs() -> u64 { 20 }
fn default_heartbeat_timeout_secs() -> u64 { 30 }
fn default_monitor_interval_ms() -> u64 { 1000 }

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            suspect_after_secs: default_suspect_after_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            monitor_interval_ms: default_monitor_interval_ms(),
        }
    }
}

// ── Events ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Broadcast buffer per subscriber; slow consumers see `Lagged`.
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
}

fn default_event_capacity() -> usize { 1024 }

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
        }
    }
}
