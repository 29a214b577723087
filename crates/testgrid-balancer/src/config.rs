//! Balancer configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use testgrid_core::time::duration_str;

use crate::strategy::Strategy;

/// Multiplier applied to a worker's weight when it advertises
/// `key = value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityBonus {
    pub key: String,
    pub value: String,
    pub multiplier: f64,
}

impl CapabilityBonus {
    pub fn new(key: &str, value: &str, multiplier: f64) -> Self {
        Self {
            key: key.to_string(),
            value: value.to_string(),
            multiplier,
        }
    }
}

/// Default bonuses: Linux hosts, 16GB of memory and 8 cores.
pub fn default_capability_bonuses() -> Vec<CapabilityBonus> {
    vec![
        CapabilityBonus::new("os", "linux", 1.2),
        CapabilityBonus::new("memory", "16GB", 1.5),
        CapabilityBonus::new("cpu_cores", "8", 1.3),
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    /// Initial strategy name. Unknown names fall back to
    /// `weighted_round_robin`.
    pub strategy: String,
    /// Added to the load before inverting it, so idle workers get a finite
    /// weight.
    pub load_epsilon: f64,
    pub capability_bonuses: Vec<CapabilityBonus>,
    /// Number of recent load samples the predictive strategy fits.
    pub prediction_window: usize,
    /// Steps ahead the fitted slope is extrapolated.
    pub prediction_horizon: f64,
    #[serde(with = "duration_str")]
    pub metrics_interval: Duration,
    /// Entries kept per node and for strategy history.
    pub history_limit: usize,
    /// Seed for the weighted draw. `None` seeds from the OS.
    pub rng_seed: Option<u64>,
    /// Consult the profiler on every metrics refresh.
    pub auto_optimize: bool,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::WeightedRoundRobin.to_string(),
            load_epsilon: 0.1,
            capability_bonuses: default_capability_bonuses(),
            prediction_window: 10,
            prediction_horizon: 10.0,
            metrics_interval: Duration::from_secs(5),
            history_limit: 1000,
            rng_seed: None,
            auto_optimize: false,
        }
    }
}

impl BalancerConfig {
    pub fn initial_strategy(&self) -> Strategy {
        Strategy::from_name_lossy(&self.strategy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: BalancerConfig = toml::from_str(
            r#"
            strategy = "least_load"
            metrics_interval = "1s"
            "#,
        )
        .unwrap();
        assert_eq!(config.initial_strategy(), Strategy::LeastLoad);
        assert_eq!(config.metrics_interval, Duration::from_secs(1));
        assert_eq!(config.capability_bonuses.len(), 3);
        assert_eq!(config.history_limit, 1000);
    }

    #[test]
    fn custom_bonuses_replace_defaults() {
        let config: BalancerConfig = toml::from_str(
            r#"
            [[capability_bonuses]]
            key = "gpu"
            value = "a100"
            multiplier = 3.0
            "#,
        )
        .unwrap();
        assert_eq!(config.capability_bonuses, vec![CapabilityBonus::new("gpu", "a100", 3.0)]);
    }
}
