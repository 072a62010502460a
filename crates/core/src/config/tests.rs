use crate::types::{JobKind, MB};

use super::types::SchedulerConfig;

#[test]
fn empty_toml_yields_defaults() {
    let cfg = SchedulerConfig::from_toml("").unwrap();
    assert_eq!(cfg.placement.poll_interval_ms, 100);
    assert_eq!(cfg.registry.safety_margin_mb, 2000);
    assert_eq!(cfg.registry.safety_margin_bytes(), 2000 * MB);
    assert_eq!(cfg.registry.gpus.len(), 1);
    assert_eq!(cfg.estimator.models["mace-mp-0-large"], 8000);
    assert_eq!(cfg.lifecycle.max_oom_retries, 1);
    assert_eq!(cfg.placement.max_skip_count, None);
}

#[test]
fn parse_full_toml() {
    let toml = r#"
[placement]
poll_interval_ms = 250
lookahead = 4
max_skip_count = 3

[scoring]
affinity = 80.0

[registry]
safety_margin_mb = 1500

[[registry.gpus]]
id = 0
memory_total_mb = 24000
resident_models = ["mace_prod"]

[[registry.gpus]]
id = 1
name = "A100"
memory_total_mb = 40000
memory_free_mb = 38000
reserved = true

[estimator]
per_atom_mb = 3

[estimator.models]
mace_prod = 6000

[estimator.multipliers]
heat-capacity = 2.5

[lifecycle]
cancel_grace_secs = 5

[lifecycle.timeouts]
single-point = 120

[health]
heartbeat_interval_secs = 5
suspect_after_secs = 10
heartbeat_timeout_secs = 15
"#;
    let cfg = SchedulerConfig::from_toml(toml).unwrap();
    assert_eq!(cfg.placement.lookahead, 4);
    assert_eq!(cfg.placement.max_skip_count, Some(3));
    assert_eq!(cfg.scoring.affinity, 80.0);
    assert_eq!(cfg.scoring.memory, 40.0);
    assert_eq!(cfg.registry.gpus.len(), 2);
    assert_eq!(cfg.registry.gpus[0].resident_models, vec!["mace_prod".to_string()]);
    assert!(cfg.registry.gpus[1].reserved);
    assert_eq!(cfg.estimator.models["mace_prod"], 6000);
    assert_eq!(cfg.estimator.multiplier_for(JobKind::HeatCapacity), 2.5);
    // A partial table replaces the default one.
    assert_eq!(cfg.estimator.multiplier_for(JobKind::Optimization), 1.0);
    assert_eq!(cfg.lifecycle.timeout_for(JobKind::SinglePoint, None), 120);
    assert_eq!(cfg.health.heartbeat_timeout_secs, 15);
}

#[test]
fn custom_timeout_is_capped() {
    let cfg = SchedulerConfig::default();
    assert_eq!(cfg.lifecycle.timeout_for(JobKind::Optimization, None), 1800);
    assert_eq!(cfg.lifecycle.timeout_for(JobKind::Optimization, Some(60)), 60);
    assert_eq!(
        cfg.lifecycle.timeout_for(JobKind::Optimization, Some(1_000_000)),
        86400
    );
}

#[test]
fn rejects_duplicate_gpu_ids() {
    let toml = r#"
[[registry.gpus]]
id = 0
memory_total_mb = 24000

[[registry.gpus]]
id = 0
memory_total_mb = 16000
"#;
    let err = SchedulerConfig::from_toml(toml).unwrap_err();
    assert!(err.to_string().contains("duplicate GPU id 0"), "{err}");
}

#[test]
fn rejects_inverted_health_thresholds() {
    let toml = r#"
[health]
heartbeat_interval_secs = 10
suspect_after_secs = 40
heartbeat_timeout_secs = 30
"#;
    assert!(SchedulerConfig::from_toml(toml).is_err());
}

#[test]
fn rejects_non_growing_oom_factor() {
    let toml = r#"
[estimator]
oom_growth_factor = 1.0
"#;
    assert!(SchedulerConfig::from_toml(toml).is_err());
}

#[test]
fn rejects_free_above_total() {
    let toml = r#"
[[registry.gpus]]
id = 2
memory_total_mb = 1000
memory_free_mb = 2000
"#;
    assert!(SchedulerConfig::from_toml(toml).is_err());
}

#[test]
fn rejects_out_of_range_lifecycle_durations() {
    for toml in [
        "[lifecycle]\ncancel_grace_secs = 0\n",
        "[lifecycle]\ndefault_timeout_secs = 90000\n",
        "[lifecycle]\nmax_timeout_secs = 0\n",
        "[lifecycle]\nmax_timeout_secs = 9223372036854775807\n",
        "[lifecycle.timeouts]\nstability = 0\n",
        "[lifecycle.timeouts]\nstability = 100000\n",
        "[health]\nheartbeat_timeout_secs = 9223372036854775807\n",
    ] {
        let err = SchedulerConfig::from_toml(toml).unwrap_err();
        assert!(matches!(err, crate::error::SchedulerError::Config(_)), "{toml}: {err}");
    }
    let ok = "[lifecycle]\nmax_timeout_secs = 200000\n[lifecycle.timeouts]\nstability = 100000\n";
    assert_eq!(
        SchedulerConfig::from_toml(ok).unwrap().lifecycle.timeouts[&JobKind::Stability],
        100000
    );
}

#[test]
fn invalid_toml_is_a_parse_error() {
    let err = SchedulerConfig::from_toml("[placement\nlookahead = ").unwrap_err();
    assert!(matches!(err, crate::error::SchedulerError::ConfigParse(_)));
}

#[test]
fn shipped_sample_config_parses() {
    let cfg = SchedulerConfig::from_toml(include_str!("../../../../config/scheduler.toml")).unwrap();
    assert_eq!(cfg.registry.gpus.len(), 2);
    assert_eq!(cfg.registry.gpus[1].resident_models, vec!["mace-mp-0-medium".to_string()]);
    assert_eq!(cfg.lifecycle.timeouts[&JobKind::BulkModulus], 3600);
    assert_eq!(cfg.estimator.models.len(), 9);
}
