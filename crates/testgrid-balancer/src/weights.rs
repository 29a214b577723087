//! Worker weights from capabilities and load.

use std::collections::BTreeMap;

use testgrid_core::{Capabilities, Worker, WorkerId, WorkerStatus};

use crate::config::CapabilityBonus;

/// Product of every bonus whose `key = value` the worker advertises.
pub fn capability_weight(capabilities: &Capabilities, bonuses: &[CapabilityBonus]) -> f64 {
    bonuses
        .iter()
        .filter(|b| capabilities.get(&b.key).is_some_and(|v| *v == b.value))
        .fold(1.0, |weight, b| weight * b.multiplier)
}

/// Inverse load with `epsilon` keeping idle workers finite.
pub fn load_weight(current_load: f64, epsilon: f64) -> f64 {
    1.0 / (current_load.max(0.0) + epsilon)
}

/// Normalized weights for every non-offline worker.
///
/// Weights sum to 1. When the raw weights sum to zero (or are not
/// finite) every worker gets the same share.
pub fn compute_weights(
    workers: &[Worker],
    bonuses: &[CapabilityBonus],
    epsilon: f64,
) -> BTreeMap<WorkerId, f64> {
    let raw: Vec<(&Worker, f64)> = workers
        .iter()
        .filter(|w| w.status != WorkerStatus::Offline)
        .map(|w| {
            let weight = capability_weight(&w.capabilities, bonuses)
                * load_weight(w.current_load, epsilon);
            (w, weight)
        })
        .collect();

    let total: f64 = raw.iter().map(|(_, weight)| weight).sum();
    if raw.is_empty() {
        return BTreeMap::new();
    }
    if total <= 0.0 || !total.is_finite() {
        let uniform = 1.0 / raw.len() as f64;
        return raw.into_iter().map(|(w, _)| (w.id.clone(), uniform)).collect();
    }

    raw.into_iter()
        .map(|(w, weight)| (w.id.clone(), weight / total))
        .collect()
}
