//! Result aggregator.

use std::collections::BTreeMap;

use tokio::sync::RwLock;
use tracing::debug;

use testgrid_core::stats::mean;
use testgrid_core::{DescriptiveStats, ResultStatus, TaskId, TaskResult, WorkerId};

use crate::summary::{
    Counts, FailedTask, OverallSummary, SlowTask, TaskSummary, WorkerPerformance,
};

#[derive(Default)]
struct Store {
    by_task: BTreeMap<TaskId, Vec<TaskResult>>,
    /// Metric samples per task, per metric name, in arrival order.
    metrics: BTreeMap<TaskId, BTreeMap<String, Vec<f64>>>,
}

#[derive(Default)]
pub struct ResultAggregator {
    store: RwLock<Store>,
}

fn count(results: &[&TaskResult]) -> Counts {
    let mut counts = Counts {
        total: results.len(),
        ..Counts::default()
    };
    for r in results {
        match r.status {
            ResultStatus::Passed => counts.passed += 1,
            ResultStatus::Failed => counts.failed += 1,
            ResultStatus::Error => counts.errored += 1,
        }
    }
    counts
}

fn durations(results: &[&TaskResult]) -> Vec<f64> {
    results.iter().map(|r| r.duration_secs).collect()
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_result(&self, result: TaskResult) {
        let mut store = self.store.write().await;
        if let Some(metrics) = &result.metrics {
            let history = store.metrics.entry(result.task_id.clone()).or_default();
            for (name, value) in metrics {
                history.entry(name.clone()).or_default().push(*value);
            }
        }
        debug!(task_id = %result.task_id, worker_id = %result.worker_id, status = ?result.status, "result recorded");
        store
            .by_task
            .entry(result.task_id.clone())
            .or_default()
            .push(result);
    }

    pub async fn result_count(&self) -> usize {
        self.store.read().await.by_task.values().map(Vec::len).sum()
    }

    /// Every result recorded for `task_id`, oldest first.
    pub async fn results_for(&self, task_id: &str) -> Vec<TaskResult> {
        self.store
            .read()
            .await
            .by_task
            .get(task_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn summary(&self, task_id: &str) -> TaskSummary {
        let store = self.store.read().await;
        let Some(results) = store.by_task.get(task_id) else {
            return TaskSummary {
                task_id: task_id.to_string(),
                ..TaskSummary::default()
            };
        };
        let results: Vec<&TaskResult> = results.iter().collect();
        let counts = count(&results);

        let metrics = store
            .metrics
            .get(task_id)
            .map(|m| {
                m.iter()
                    .map(|(name, values)| (name.clone(), DescriptiveStats::from_samples(values)))
                    .collect()
            })
            .unwrap_or_default();

        TaskSummary {
            task_id: task_id.to_string(),
            counts,
            pass_rate: counts.pass_rate(),
            duration: DescriptiveStats::from_samples(&durations(&results)),
            metrics,
            last_run: results.iter().map(|r| r.timestamp).max(),
        }
    }

    pub async fn overall_summary(&self) -> OverallSummary {
        let store = self.store.read().await;
        let all: Vec<&TaskResult> = store.by_task.values().flatten().collect();
        let counts = count(&all);
        OverallSummary {
            tasks: store.by_task.len(),
            counts,
            pass_rate: counts.pass_rate(),
            duration: DescriptiveStats::from_samples(&durations(&all)),
            last_run: all.iter().map(|r| r.timestamp).max(),
        }
    }

    /// Tasks with at least one failed or errored attempt.
    pub async fn failed_tasks(&self) -> Vec<FailedTask> {
        let store = self.store.read().await;
        store
            .by_task
            .iter()
            .filter_map(|(task_id, results)| {
                let failures: Vec<&TaskResult> =
                    results.iter().filter(|r| !r.status.is_success()).collect();
                let last_failure = failures.iter().map(|r| r.timestamp).max()?;
                Some(FailedTask {
                    task_id: task_id.clone(),
                    failures: failures.len(),
                    errors: failures.iter().filter_map(|r| r.error.clone()).collect(),
                    last_failure,
                })
            })
            .collect()
    }

    /// Tasks whose mean duration exceeds `threshold_secs`, slowest first.
    pub async fn slow_tasks(&self, threshold_secs: f64) -> Vec<SlowTask> {
        let store = self.store.read().await;
        let mut slow: Vec<SlowTask> = store
            .by_task
            .iter()
            .filter(|(_, results)| !results.is_empty())
            .filter_map(|(task_id, results)| {
                let d: Vec<f64> = results.iter().map(|r| r.duration_secs).collect();
                let mean_duration = mean(&d);
                (mean_duration > threshold_secs).then(|| SlowTask {
                    task_id: task_id.clone(),
                    mean_duration,
                    runs: results.len(),
                    last_run: results.iter().map(|r| r.timestamp).max().unwrap_or(0),
                })
            })
            .collect();
        slow.sort_by(|a, b| b.mean_duration.total_cmp(&a.mean_duration));
        slow
    }

    pub async fn per_worker_performance(&self) -> BTreeMap<WorkerId, WorkerPerformance> {
        let store = self.store.read().await;
        let mut grouped: BTreeMap<&str, Vec<&TaskResult>> = BTreeMap::new();
        for result in store.by_task.values().flatten() {
            grouped.entry(result.worker_id.as_str()).or_default().push(result);
        }

        grouped
            .into_iter()
            .map(|(worker_id, results)| {
                let counts = count(&results);
                let perf = WorkerPerformance {
                    worker_id: worker_id.to_string(),
                    counts,
                    success_rate: counts.pass_rate(),
                    mean_duration: mean(&durations(&results)),
                };
                (worker_id.to_string(), perf)
            })
            .collect()
    }
}
