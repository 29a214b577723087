//! Registry configuration (`[registry]` in testgrid.toml).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use testgrid_core::time::duration_str;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Interval at which workers are expected to heartbeat. Workers silent
    /// for twice this long are removed by the sweep.
    #[serde(with = "duration_str")]
    pub heartbeat_interval: Duration,
    /// Heartbeat age beyond which a worker is no longer offered for work.
    #[serde(with = "duration_str")]
    pub heartbeat_timeout: Duration,
    /// How often the dead-worker sweep runs.
    #[serde(with = "duration_str")]
    pub sweep_interval: Duration,
    /// Number of response-time samples retained per worker.
    pub response_time_window: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(30),
            response_time_window: 100,
        }
    }
}

impl RegistryConfig {
    /// Heartbeat age after which the sweep removes a worker.
    pub fn dead_after(&self) -> Duration {
        self.heartbeat_interval * 2
    }
}
