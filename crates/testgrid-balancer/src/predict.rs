//! Linear load extrapolation for the predictive strategy.

/// Least-squares slope of `samples` against their indices (0, 1, 2, …).
///
/// Returns 0.0 for fewer than two samples.
pub fn least_squares_slope(samples: &[f64]) -> f64 {
    let n = samples.len();
    if n < 2 {
        return 0.0;
    }
    let n_f = n as f64;
    let x_mean = (n_f - 1.0) / 2.0;
    let y_mean = samples.iter().sum::<f64>() / n_f;

    let (mut num, mut den) = (0.0, 0.0);
    for (i, y) in samples.iter().enumerate() {
        let dx = i as f64 - x_mean;
        num += dx * (y - y_mean);
        den += dx * dx;
    }
    if den == 0.0 { 0.0 } else { num / den }
}

/// `current_load + slope × horizon`, where the slope is fitted over
/// `samples` in chronological order (oldest first).
pub fn predict_load(current_load: f64, samples: &[f64], horizon: f64) -> f64 {
    current_load + least_squares_slope(samples) * horizon
}
