use std::time::Duration;

use serde::{Deserialize, Serialize};
use testgrid_core::time::duration_str;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscaleConfig {
    /// When false the monitoring loop never starts.
    pub enabled: bool,
    pub min_workers: usize,
    pub max_workers: usize,
    /// Utilization above which the fleet grows.
    pub scale_up_threshold: f64,
    /// Utilization below which the fleet shrinks.
    pub scale_down_threshold: f64,
    /// Share of the current fleet added per scale-up.
    pub scale_up_factor: f64,
    /// Share of the current fleet removed per scale-down.
    pub scale_down_factor: f64,
    #[serde(with = "duration_str")]
    pub cooldown: Duration,
    /// Age after which snapshots are pruned.
    #[serde(with = "duration_str")]
    pub metrics_window: Duration,
    #[serde(with = "duration_str")]
    pub interval: Duration,
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_workers: 1,
            max_workers: 10,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.2,
            scale_up_factor: 0.5,
            scale_down_factor: 0.25,
            cooldown: Duration::from_secs(300),
            metrics_window: Duration::from_secs(300),
            interval: Duration::from_secs(60),
        }
    }
}
