//! Scheduler configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use testgrid_core::time::duration_str;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Retry budget for tasks that do not set their own.
    pub default_max_retries: u32,
    /// Time a task may stay assigned before it is failed, unless the task
    /// sets its own timeout.
    #[serde(with = "duration_str")]
    pub task_timeout: Duration,
    /// Load added to a worker per assigned task and removed on release.
    pub load_increment: f64,
    /// Fallback wake-up interval of the dispatch loop.
    #[serde(with = "duration_str")]
    pub dispatch_interval: Duration,
    /// Completed-task durations kept for the rolling mean.
    pub duration_window: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            task_timeout: Duration::from_secs(300),
            load_increment: 0.1,
            dispatch_interval: Duration::from_secs(1),
            duration_window: 50,
        }
    }
}
