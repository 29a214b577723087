//! Query result types.

use std::collections::BTreeMap;

use serde::Serialize;
use testgrid_core::{DescriptiveStats, TaskId, WorkerId};

/// Outcome counts shared by task and overall summaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Counts {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
}

impl Counts {
    /// Passed share in percent; 0 when empty.
    pub fn pass_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.passed as f64 / self.total as f64 * 100.0
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaskSummary {
    pub task_id: TaskId,
    #[serde(flatten)]
    pub counts: Counts,
    pub pass_rate: f64,
    pub duration: DescriptiveStats,
    /// Stats per reported metric name.
    pub metrics: BTreeMap<String, DescriptiveStats>,
    /// Epoch milliseconds of the most recent result.
    pub last_run: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OverallSummary {
    /// Distinct task ids with at least one result.
    pub tasks: usize,
    #[serde(flatten)]
    pub counts: Counts,
    pub pass_rate: f64,
    pub duration: DescriptiveStats,
    pub last_run: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedTask {
    pub task_id: TaskId,
    /// Failed plus errored attempts.
    pub failures: usize,
    pub errors: Vec<String>,
    pub last_failure: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlowTask {
    pub task_id: TaskId,
    pub mean_duration: f64,
    pub runs: usize,
    pub last_run: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkerPerformance {
    pub worker_id: WorkerId,
    #[serde(flatten)]
    pub counts: Counts,
    /// Passed share in percent.
    pub success_rate: f64,
    pub mean_duration: f64,
}
