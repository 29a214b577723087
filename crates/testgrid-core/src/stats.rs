//! Descriptive statistics over `f64` samples.
//!
//! Empty input yields zeroes rather than NaN so that query results over
//! unknown or empty data stay well-formed.

use serde::Serialize;

/// Arithmetic mean, or 0.0 for an empty slice.
pub fn mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().sum::<f64>() / samples.len() as f64
}

/// Sample standard deviation (n − 1 denominator), or 0.0 for fewer than
/// two samples.
pub fn sample_std_dev(samples: &[f64]) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let m = mean(samples);
    let variance = samples.iter().map(|x| (x - m).powi(2)).sum::<f64>()
        / (samples.len() - 1) as f64;
    variance.sqrt()
}

/// Mean, extremes and spread of a sample set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DescriptiveStats {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub std_dev: f64,
}

impl DescriptiveStats {
    pub fn from_samples(samples: &[f64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let min = samples.iter().copied().fold(f64::INFINITY, f64::min);
        let max = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Self {
            mean: mean(samples),
            min,
            max,
            std_dev: sample_std_dev(samples),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_of_three_durations() {
        let stats = DescriptiveStats::from_samples(&[1.0, 2.0, 3.0]);
        assert_eq!(stats.mean, 2.0);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 3.0);
        assert!((stats.std_dev - 1.0).abs() < 1e-9);
    }

    #[test]
    fn empty_samples_are_zeroed() {
        assert_eq!(DescriptiveStats::from_samples(&[]), DescriptiveStats::default());
        assert_eq!(mean(&[]), 0.0);
    }

    #[test]
    fn single_sample_has_no_spread() {
        let stats = DescriptiveStats::from_samples(&[4.5]);
        assert_eq!(stats.mean, 4.5);
        assert_eq!(stats.std_dev, 0.0);
    }
}
