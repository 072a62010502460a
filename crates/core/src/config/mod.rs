//! Scheduler configuration: TOML file, `MOFSIM_*` env overrides, validation.

mod loading;
mod types;
mod validation;

#[cfg(test)]
mod tests;

pub use loading::load_dotenv;
pub use types::{
    EstimatorConfig, EventsConfig, GpuSpec, HealthConfig, LifecycleConfig, PlacementConfig,
    RegistryConfig, SchedulerConfig, ScoringWeights,
};
