use std::collections::HashSet;

use super::types::SchedulerConfig;
use crate::error::SchedulerError;

/// Longest timeout, grace window or heartbeat threshold accepted (one year).
pub const MAX_DURATION_SECS: u64 = 366 * 24 * 3600;

impl SchedulerConfig {
    /// Validate the config: GPU inventory, thresholds ordering, factors.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        self.validate_gpus()?;
        self.validate_health_thresholds()?;
        self.validate_estimator()?;
        self.validate_placement()?;
        self.validate_lifecycle()?;
        Ok(())
    }

    fn validate_gpus(&self) -> Result<(), SchedulerError> {
        if self.registry.gpus.is_empty() {
            return Err(SchedulerError::Config("registry.gpus must list at least one GPU".into()));
        }
        let mut seen = HashSet::new();
        for gpu in &self.registry.gpus {
            if !seen.insert(gpu.id) {
                return Err(SchedulerError::Config(format!("duplicate GPU id {}", gpu.id)));
            }
            if gpu.memory_total_mb == 0 {
                return Err(SchedulerError::Config(format!(
                    "GPU {} has zero total memory",
                    gpu.id
                )));
            }
            if let Some(free) = gpu.memory_free_mb {
                if free > gpu.memory_total_mb {
                    return Err(SchedulerError::Config(format!(
                        "GPU {} free memory {free}MB exceeds total {}MB",
                        gpu.id, gpu.memory_total_mb
                    )));
                }
            }
        }
        if self.registry.max_models_per_gpu == 0 {
            return Err(SchedulerError::Config("registry.max_models_per_gpu must be > 0".into()));
        }
        Ok(())
    }

    /// Suspect must come before dead, and both after one heartbeat interval.
    fn validate_health_thresholds(&self) -> Result<(), SchedulerError> {
        let h = &self.health;
        if h.heartbeat_interval_secs == 0 {
            return Err(SchedulerError::Config("health.heartbeat_interval_secs must be > 0".into()));
        }
        if h.suspect_after_secs < h.heartbeat_interval_secs {
            return Err(SchedulerError::Config(format!(
                "health.suspect_after_secs ({}) is shorter than the heartbeat interval ({})",
                h.suspect_after_secs, h.heartbeat_interval_secs
            )));
        }
        if h.heartbeat_timeout_secs > MAX_DURATION_SECS {
            return Err(SchedulerError::Config(format!(
                "health.heartbeat_timeout_secs ({}) exceeds {MAX_DURATION_SECS}",
                h.heartbeat_timeout_secs
            )));
        }
        if h.heartbeat_timeout_secs < h.suspect_after_secs {
            return Err(SchedulerError::Config(format!(
                "health.heartbeat_timeout_secs ({}) is shorter than suspect_after_secs ({})",
                h.heartbeat_timeout_secs, h.suspect_after_secs
            )));
        }
        Ok(())
    }

    fn validate_estimator(&self) -> Result<(), SchedulerError> {
        if !(self.estimator.oom_growth_factor > 1.0) {
            return Err(SchedulerError::Config(format!(
                "estimator.oom_growth_factor must be > 1.0, got {}",
                self.estimator.oom_growth_factor
            )));
        }
        for (kind, m) in &self.estimator.multipliers {
            if !(*m > 0.0) {
                return Err(SchedulerError::Config(format!(
                    "estimator multiplier for {kind} must be positive, got {m}"
                )));
            }
        }
        Ok(())
    }

    fn validate_placement(&self) -> Result<(), SchedulerError> {
        if self.placement.poll_interval_ms == 0 {
            return Err(SchedulerError::Config("placement.poll_interval_ms must be > 0".into()));
        }
        if self.placement.lookahead == 0 {
            return Err(SchedulerError::Config("placement.lookahead must be >= 1".into()));
        }
        if self.scoring.max_temperature_c <= 0.0 {
            return Err(SchedulerError::Config("scoring.max_temperature_c must be positive".into()));
        }
        Ok(())
    }

    /// Every timeout and the cancel grace lie in `1..=max_timeout_secs`, and
    /// the cap itself stays within [`MAX_DURATION_SECS`].
    fn validate_lifecycle(&self) -> Result<(), SchedulerError> {
        let l = &self.lifecycle;
        if l.max_timeout_secs == 0 || l.max_timeout_secs > MAX_DURATION_SECS {
            return Err(SchedulerError::Config(format!(
                "lifecycle.max_timeout_secs must be in 1..={MAX_DURATION_SECS}, got {}",
                l.max_timeout_secs
            )));
        }
        let in_range = |name: String, secs: u64| {
            if secs == 0 || secs > l.max_timeout_secs {
                Err(SchedulerError::Config(format!(
                    "{name} must be in 1..={}, got {secs}",
                    l.max_timeout_secs
                )))
            } else {
                Ok(())
            }
        };
        in_range("lifecycle.default_timeout_secs".into(), l.default_timeout_secs)?;
        in_range("lifecycle.cancel_grace_secs".into(), l.cancel_grace_secs)?;
        for (kind, secs) in &l.timeouts {
            in_range(format!("lifecycle.timeouts.{kind}"), *secs)?;
        }
        Ok(())
    }
}
