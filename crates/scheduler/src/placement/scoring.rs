//! GPU scoring.
//!
//! `affinity·w_a + (free/total)·w_m + (1 − utilization)·w_u + (1 − temp/max)·w_t`
//!
//! Affinity is 1 when the task's model is resident, the spare-slot credit
//! when the GPU's model cache has room, and 0 otherwise. The weights are
//! tunable; only the ranking they induce matters.

use std::cmp::Ordering;

use mofsim_core::config::ScoringWeights;

use crate::registry::GpuView;

pub fn affinity(gpu: &GpuView, model_id: &str, weights: &ScoringWeights) -> f64 {
    if gpu.has_model(model_id) {
        1.0
    } else if gpu.model_slots_free > 0 {
        weights.spare_slot_affinity
    } else {
        0.0
    }
}

pub fn score_gpu(gpu: &GpuView, model_id: &str, weights: &ScoringWeights) -> f64 {
    let memory = if gpu.total_bytes == 0 {
        0.0
    } else {
        gpu.free_bytes as f64 / gpu.total_bytes as f64
    };
    let utilization = 1.0 - gpu.utilization.clamp(0.0, 1.0);
    let thermal = 1.0 - (gpu.temperature_c / weights.max_temperature_c).clamp(0.0, 1.0);

    weights.affinity * affinity(gpu, model_id, weights)
        + weights.memory * memory
        + weights.utilization * utilization
        + weights.temperature * thermal
}

/// Best first; equal scores go to the lowest GPU id.
pub fn rank(candidates: Vec<GpuView>, model_id: &str, weights: &ScoringWeights) -> Vec<(GpuView, f64)> {
    let mut scored: Vec<_> = candidates
        .into_iter()
        .map(|gpu| {
            let score = score_gpu(&gpu, model_id, weights);
            (gpu, score)
        })
        .collect();
    scored.sort_by(|a, b| match b.1.total_cmp(&a.1) {
        Ordering::Equal => a.0.id.cmp(&b.0.id),
        other => other,
    });
    scored
}

#[cfg(test)]
mod tests {
    use super::*;
    use mofsim_core::{GpuStatus, MB};

    fn gpu(id: u32, free_mb: u64, models: &[&str]) -> GpuView {
        GpuView {
            id,
            name: format!("GPU {id}"),
            status: GpuStatus::Free,
            total_bytes: 24000 * MB,
            free_bytes: free_mb * MB,
            utilization: 0.0,
            temperature_c: 40.0,
            resident_models: models.iter().map(|m| m.to_string()).collect(),
            model_slots_free: 2 - models.len(),
            current_task: None,
            error_message: None,
            last_released_at: None,
            telemetry_at: None,
        }
    }

    fn best(candidates: Vec<GpuView>, model: &str) -> u32 {
        rank(candidates, model, &ScoringWeights::default())[0].0.id
    }

    #[test]
    fn resident_model_beats_more_free_memory() {
        let with_model = gpu(1, 8000, &["mace_prod"]);
        let roomy = gpu(0, 22000, &[]);
        assert_eq!(best(vec![roomy, with_model], "mace_prod"), 1);
    }

    #[test]
    fn spare_cache_slot_beats_full_cache() {
        let full = gpu(0, 20000, &["a", "b"]);
        let spare = gpu(1, 20000, &["a"]);
        assert_eq!(best(vec![full, spare], "c"), 1);
    }

    #[test]
    fn more_free_memory_wins_all_else_equal() {
        assert_eq!(best(vec![gpu(0, 10000, &[]), gpu(1, 15000, &[])], "x"), 1);
    }

    #[test]
    fn idle_and_cool_gpus_win() {
        let mut busy = gpu(0, 15000, &[]);
        busy.utilization = 0.9;
        assert_eq!(best(vec![busy, gpu(1, 15000, &[])], "x"), 1);

        let mut hot = gpu(0, 15000, &[]);
        hot.temperature_c = 85.0;
        assert_eq!(best(vec![hot, gpu(1, 15000, &[])], "x"), 1);
    }

    #[test]
    fn ties_go_to_lowest_id() {
        let ranked = rank(
            vec![gpu(5, 15000, &[]), gpu(2, 15000, &[]), gpu(7, 15000, &[])],
            "x",
            &ScoringWeights::default(),
        );
        let ids: Vec<_> = ranked.iter().map(|(g, _)| g.id).collect();
        assert_eq!(ids, vec![2, 5, 7]);
    }

    #[test]
    fn score_stays_within_weight_sum() {
        let w = ScoringWeights::default();
        let mut hot = gpu(0, 0, &["a", "b"]);
        hot.temperature_c = 250.0;
        hot.utilization = 1.0;
        assert_eq!(score_gpu(&hot, "x", &w), 0.0);
        let ideal = GpuView {
            temperature_c: 0.0,
            free_bytes: 24000 * MB,
            ..gpu(1, 0, &["x"])
        };
        assert_eq!(score_gpu(&ideal, "x", &w), 190.0);
    }
}
