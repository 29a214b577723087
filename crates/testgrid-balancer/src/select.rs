//! Per-strategy pick over an already-filtered candidate list.
//!
//! Every `argmin` picks the first candidate holding the minimum, so ties
//! go to the lowest worker id (candidates arrive ordered by id).

use std::collections::{BTreeMap, HashMap};

use rand::Rng;
use testgrid_core::{Worker, WorkerId};

/// Draw one candidate with probability proportional to its weight.
///
/// Walks the candidates and returns the first whose running sum meets or
/// exceeds the draw. Candidates without a weight count as zero and are never
/// drawn. When no candidate carries weight the first one is returned.
pub fn weighted<'a, R: Rng>(
    candidates: &'a [Worker],
    weights: &BTreeMap<WorkerId, f64>,
    rng: &mut R,
) -> Option<&'a Worker> {
    let weight_of = |w: &Worker| weights.get(&w.id).copied().unwrap_or(0.0).max(0.0);
    let total: f64 = candidates.iter().map(weight_of).sum();
    if total <= 0.0 || !total.is_finite() {
        return candidates.first();
    }

    let draw = rng.gen_range(0.0..total);
    let mut cumulative = 0.0;
    for worker in candidates {
        let weight = weight_of(worker);
        cumulative += weight;
        if weight > 0.0 && draw <= cumulative {
            return Some(worker);
        }
    }
    // Rounding can leave the draw a hair past the final sum.
    candidates.last()
}

pub fn least_load(candidates: &[Worker]) -> Option<&Worker> {
    argmin(candidates, |w| w.current_load)
}

pub fn least_connections(candidates: &[Worker]) -> Option<&Worker> {
    argmin(candidates, |w| f64::from(w.active_connections))
}

/// Workers without response-time samples rank last.
pub fn fastest_response(candidates: &[Worker]) -> Option<&Worker> {
    argmin(candidates, |w| w.mean_response_time().unwrap_or(f64::INFINITY))
}

pub fn lowest_predicted<'a>(
    candidates: &'a [Worker],
    predicted: &HashMap<WorkerId, f64>,
) -> Option<&'a Worker> {
    argmin(candidates, |w| {
        predicted.get(&w.id).copied().unwrap_or(w.current_load)
    })
}

fn argmin<F>(candidates: &[Worker], key: F) -> Option<&Worker>
where
    F: Fn(&Worker) -> f64,
{
    let mut best: Option<(&Worker, f64)> = None;
    for worker in candidates {
        let value = key(worker);
        match best {
            Some((_, current)) if value >= current => {}
            _ => best = Some((worker, value)),
        }
    }
    best.map(|(worker, _)| worker)
}
