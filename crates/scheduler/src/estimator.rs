//! GPU memory estimation with adaptive per-model correction.
//!
//! `estimate = (base(model) + atoms * per_atom) * multiplier(kind)`.
//! Out-of-memory reports permanently raise a model's base cost; the table
//! never shrinks for the lifetime of the process.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::Serialize;
use tracing::info;

use mofsim_core::config::EstimatorConfig;
use mofsim_core::{JobKind, MB};

/// Breakdown of a single estimate, all in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MemoryEstimate {
    pub model_base_bytes: u64,
    pub atom_bytes: u64,
    pub multiplier: f64,
    pub total_bytes: u64,
}

#[derive(Debug)]
pub struct MemoryEstimator {
    config: EstimatorConfig,
    /// Model id -> base cost in bytes. Seeded from config, grown on OOM.
    base_costs: RwLock<HashMap<String, u64>>,
}

impl MemoryEstimator {
    pub fn new(config: EstimatorConfig) -> Self {
        let base_costs = config
            .models
            .iter()
            .map(|(model, mb)| (model.clone(), mb * MB))
            .collect();
        Self {
            config,
            base_costs: RwLock::new(base_costs),
        }
    }

    /// Current base cost for a model (the configured default if unknown).
    pub fn base_cost(&self, model_id: &str) -> u64 {
        self.base_costs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(model_id)
            .copied()
            .unwrap_or(self.config.default_model_mb * MB)
    }

    pub fn estimate(&self, model_id: &str, atom_count: u32, kind: JobKind) -> u64 {
        self.estimate_detailed(model_id, atom_count, kind).total_bytes
    }

    pub fn estimate_detailed(&self, model_id: &str, atom_count: u32, kind: JobKind) -> MemoryEstimate {
        let model_base_bytes = self.base_cost(model_id);
        let atom_bytes = u64::from(atom_count) * self.config.per_atom_mb * MB;
        let multiplier = self.config.multiplier_for(kind);
        let total_bytes = ((model_base_bytes + atom_bytes) as f64 * multiplier).ceil() as u64;
        MemoryEstimate {
            model_base_bytes,
            atom_bytes,
            multiplier,
            total_bytes,
        }
    }

    /// Raise a model's base cost after an out-of-memory report. Returns the
    /// new base cost. Never decreases.
    pub fn record_oom(&self, model_id: &str) -> u64 {
        let default = self.config.default_model_mb * MB;
        let mut costs = self.base_costs.write().unwrap_or_else(|e| e.into_inner());
        let entry = costs.entry(model_id.to_string()).or_insert(default);
        let old = *entry;
        let grown = (old as f64 * self.config.oom_growth_factor).ceil() as u64;
        *entry = grown.max(old);
        info!(
            model = model_id,
            old_mb = old / MB,
            new_mb = *entry / MB,
            "model memory estimate raised after OOM"
        );
        *entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimator() -> MemoryEstimator {
        MemoryEstimator::new(EstimatorConfig::default())
    }

    #[test]
    fn known_model_estimate() {
        let e = estimator();
        // (4000 + 500 * 2) * 1.2 = 6000 MB
        assert_eq!(e.estimate("mace-mp-0-medium", 500, JobKind::Optimization), 6000 * MB);
    }

    #[test]
    fn unknown_model_uses_default_base() {
        let e = estimator();
        let detail = e.estimate_detailed("brand-new-potential", 0, JobKind::SinglePoint);
        assert_eq!(detail.model_base_bytes, 4000 * MB);
        assert_eq!(detail.atom_bytes, 0);
        assert_eq!(detail.multiplier, 1.0);
        assert_eq!(detail.total_bytes, 4000 * MB);
    }

    #[test]
    fn job_kind_ordering_of_multipliers() {
        let e = estimator();
        let opt = e.estimate("orb-v2", 200, JobKind::Optimization);
        let bulk = e.estimate("orb-v2", 200, JobKind::BulkModulus);
        let heat = e.estimate("orb-v2", 200, JobKind::HeatCapacity);
        assert!(opt < bulk, "optimization should be cheaper than bulk-modulus");
        assert!(bulk < heat, "bulk-modulus should be cheaper than heat-capacity");
    }

    #[test]
    fn atoms_add_linearly() {
        let e = estimator();
        let small = e.estimate("orb-v2", 100, JobKind::SinglePoint);
        let large = e.estimate("orb-v2", 600, JobKind::SinglePoint);
        assert_eq!(large - small, 500 * 2 * MB);
    }

    #[test]
    fn oom_raises_base_monotonically() {
        let e = estimator();
        let before = e.estimate("orb-v2", 100, JobKind::Optimization);
        let first = e.record_oom("orb-v2");
        assert_eq!(first, (3000.0 * MB as f64 * 1.2).ceil() as u64);
        let second = e.record_oom("orb-v2");
        assert!(second > first);
        assert!(e.estimate("orb-v2", 100, JobKind::Optimization) > before);
        // Other models untouched.
        assert_eq!(e.base_cost("sevennet-0"), 3500 * MB);
    }

    #[test]
    fn oom_on_unknown_model_starts_from_default() {
        let e = estimator();
        let raised = e.record_oom("mystery");
        assert!(raised > 4000 * MB);
        assert_eq!(e.base_cost("mystery"), raised);
        assert_eq!(e.base_cost("other-mystery"), 4000 * MB);
    }
}
