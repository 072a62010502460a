use std::env;
use std::path::Path;
use std::str::FromStr;

use crate::error::SchedulerError;

use super::types::SchedulerConfig;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = env_opt(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable env override");
            None
        }
    }
}

impl SchedulerConfig {
    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, SchedulerError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SchedulerError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Defaults plus environment overrides, for running without a file.
    pub fn from_env() -> Result<Self, SchedulerError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    // ── Environment variable overrides ──────────────────────────────

    /// Apply environment variable overrides.
    ///
    /// Convention: `MOFSIM_SECTION_KEY` overrides `section.key`.
    /// Examples:
    /// - `MOFSIM_PLACEMENT_POLL_INTERVAL_MS` -> `placement.poll_interval_ms`
    /// - `MOFSIM_REGISTRY_SAFETY_MARGIN_MB` -> `registry.safety_margin_mb`
    /// - `MOFSIM_HEALTH_HEARTBEAT_TIMEOUT_SECS` -> `health.heartbeat_timeout_secs`
    pub(crate) fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse("MOFSIM_PLACEMENT_POLL_INTERVAL_MS") {
            self.placement.poll_interval_ms = v;
        }
        if let Some(v) = env_parse("MOFSIM_PLACEMENT_LOOKAHEAD") {
            self.placement.lookahead = v;
        }
        if let Some(v) = env_parse("MOFSIM_PLACEMENT_MAX_SKIP_COUNT") {
            self.placement.max_skip_count = Some(v);
        }
        if let Some(v) = env_parse("MOFSIM_REGISTRY_SAFETY_MARGIN_MB") {
            self.registry.safety_margin_mb = v;
        }
        if let Some(v) = env_parse("MOFSIM_REGISTRY_MAX_MODELS_PER_GPU") {
            self.registry.max_models_per_gpu = v;
        }
        if let Some(v) = env_parse("MOFSIM_ESTIMATOR_OOM_GROWTH_FACTOR") {
            self.estimator.oom_growth_factor = v;
        }
        if let Some(v) = env_parse("MOFSIM_LIFECYCLE_CANCEL_GRACE_SECS") {
            self.lifecycle.cancel_grace_secs = v;
        }
        if let Some(v) = env_parse("MOFSIM_LIFECYCLE_MAX_OOM_RETRIES") {
            self.lifecycle.max_oom_retries = v;
        }
        if let Some(v) = env_parse("MOFSIM_HEALTH_HEARTBEAT_INTERVAL_SECS") {
            self.health.heartbeat_interval_secs = v;
        }
        if let Some(v) = env_parse("MOFSIM_HEALTH_SUSPECT_AFTER_SECS") {
            self.health.suspect_after_secs = v;
        }
        if let Some(v) = env_parse("MOFSIM_HEALTH_HEARTBEAT_TIMEOUT_SECS") {
            self.health.heartbeat_timeout_secs = v;
        }
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded:");
        tracing::info!(
            "  placement:  poll={}ms, lookahead={}, max_skip={:?}",
            self.placement.poll_interval_ms,
            self.placement.lookahead,
            self.placement.max_skip_count
        );
        tracing::info!(
            "  registry:   gpus={}, margin={}MB, model_cache={}",
            self.registry.gpus.len(),
            self.registry.safety_margin_mb,
            self.registry.max_models_per_gpu
        );
        tracing::info!(
            "  estimator:  default={}MB, per_atom={}MB, models={}",
            self.estimator.default_model_mb,
            self.estimator.per_atom_mb,
            self.estimator.models.len()
        );
        tracing::info!(
            "  lifecycle:  grace={}s, oom_retries={}",
            self.lifecycle.cancel_grace_secs,
            self.lifecycle.max_oom_retries
        );
        tracing::info!(
            "  health:     heartbeat={}s, suspect={}s, timeout={}s",
            self.health.heartbeat_interval_secs,
            self.health.suspect_after_secs,
            self.health.heartbeat_timeout_secs
        );
    }
}
