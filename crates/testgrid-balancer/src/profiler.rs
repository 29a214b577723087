//! Performance profiler seam.
//!
//! The balancer asks a profiler for recent load history (predictive
//! strategy) and for recommendations (`optimize_strategy`). The profiler
//! itself is external; `RecordingProfiler` is an in-process implementation
//! fed by the coordinator.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use testgrid_core::stats::{mean, sample_std_dev};

use crate::strategy::Strategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    LoadBalancing,
    Distribution,
    QueueOptimization,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub kind: RecommendationKind,
    pub priority: Priority,
    /// Free-form hint; for `LoadBalancing` a strategy name.
    pub suggestion: Option<String>,
    pub message: String,
}

pub trait Profiler: Send + Sync {
    /// Load of `node_id` recorded `offset` samples before the latest one
    /// (0 = latest). `None` when no such sample exists.
    fn recent_load(&self, node_id: &str, offset: usize) -> Option<f64>;

    /// Recommendations given the strategy currently in use.
    fn recommend(&self, current: Strategy) -> Vec<Recommendation>;

    /// Observe a load sample reported for `node_id`. Profilers that collect
    /// their own history can ignore this.
    fn record_load(&self, _node_id: &str, _load: f64) {}
}

/// Distribution imbalance above which work should be spread differently.
const TASK_SPREAD_THRESHOLD: f64 = 2.0;
/// Spread of per-node mean load above which balancing needs attention.
const LOAD_SPREAD_THRESHOLD: f64 = 0.2;
/// Mean queue wait, in seconds, above which the queue is a bottleneck.
const QUEUE_TIME_THRESHOLD: f64 = 1.0;

#[derive(Debug, Clone)]
struct ExecutionSample {
    node_id: String,
    queue_secs: f64,
}

#[derive(Default)]
struct Recorded {
    loads: HashMap<String, VecDeque<f64>>,
    executions: VecDeque<ExecutionSample>,
}

/// Keeps bounded load and execution histories in memory.
pub struct RecordingProfiler {
    capacity: usize,
    inner: Mutex<Recorded>,
}

impl RecordingProfiler {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Recorded::default()),
        }
    }

    /// Record that a task waited `queue_secs` before starting on `node_id`.
    pub fn record_execution(&self, node_id: &str, queue_secs: f64) {
        let capacity = self.capacity;
        let mut inner = self.lock();
        inner.executions.push_back(ExecutionSample {
            node_id: node_id.to_string(),
            queue_secs,
        });
        while inner.executions.len() > capacity {
            inner.executions.pop_front();
        }
    }

    pub fn forget(&self, node_id: &str) {
        self.lock().loads.remove(node_id);
    }

    fn lock(&self) -> MutexGuard<'_, Recorded> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Profiler for RecordingProfiler {
    fn record_load(&self, node_id: &str, load: f64) {
        let capacity = self.capacity;
        let mut inner = self.lock();
        let history = inner.loads.entry(node_id.to_string()).or_default();
        history.push_back(load);
        while history.len() > capacity {
            history.pop_front();
        }
    }

    fn recent_load(&self, node_id: &str, offset: usize) -> Option<f64> {
        let inner = self.lock();
        let history = inner.loads.get(node_id)?;
        let idx = history.len().checked_sub(offset + 1)?;
        history.get(idx).copied()
    }

    fn recommend(&self, current: Strategy) -> Vec<Recommendation> {
        let inner = self.lock();
        let mut recs = Vec::new();

        let mut per_node: HashMap<&str, f64> = HashMap::new();
        for sample in &inner.executions {
            *per_node.entry(sample.node_id.as_str()).or_default() += 1.0;
        }
        let counts: Vec<f64> = per_node.into_values().collect();
        if sample_std_dev(&counts) > TASK_SPREAD_THRESHOLD {
            recs.push(Recommendation {
                kind: RecommendationKind::Distribution,
                priority: Priority::High,
                suggestion: Some(Strategy::WeightedRoundRobin.to_string()),
                message: "task counts are unevenly spread across nodes".to_string(),
            });
        }

        let mean_loads: Vec<f64> = inner
            .loads
            .values()
            .filter(|h| !h.is_empty())
            .map(|h| h.iter().sum::<f64>() / h.len() as f64)
            .collect();
        if sample_std_dev(&mean_loads) > LOAD_SPREAD_THRESHOLD {
            let suggestion = if current == Strategy::LeastLoad {
                Strategy::Predictive
            } else {
                Strategy::LeastLoad
            };
            recs.push(Recommendation {
                kind: RecommendationKind::LoadBalancing,
                priority: Priority::Medium,
                suggestion: Some(suggestion.to_string()),
                message: "node loads diverge".to_string(),
            });
        }

        let queue: Vec<f64> = inner.executions.iter().map(|s| s.queue_secs).collect();
        if mean(&queue) > QUEUE_TIME_THRESHOLD {
            recs.push(Recommendation {
                kind: RecommendationKind::QueueOptimization,
                priority: Priority::High,
                suggestion: None,
                message: format!("mean queue time {:.2}s", mean(&queue)),
            });
        }

        recs
    }
}
