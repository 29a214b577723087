//! Per-node and per-strategy balancing metrics.
//!
//! Selection counters accumulate over a sampling window that is reset on
//! every refresh. Refreshed records are appended to bounded histories.

use std::collections::{BTreeMap, HashMap, VecDeque};

use serde::Serialize;
use testgrid_core::stats::{mean, sample_std_dev};
use testgrid_core::{Worker, WorkerId};

use crate::strategy::Strategy;

/// Live view of one worker as the balancer sees it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeStats {
    pub current_load: f64,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub network_latency: f64,
    pub active_connections: u32,
    pub avg_response_time: Option<f64>,
    pub predicted_load: Option<f64>,
    pub weight: f64,
}

/// One refreshed metrics record for a node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeMetrics {
    pub node_id: WorkerId,
    /// Epoch milliseconds.
    pub timestamp: u64,
    #[serde(flatten)]
    pub stats: NodeStats,
    pub strategy_effectiveness: f64,
    pub resource_utilization: f64,
    pub error_rate: f64,
    pub health_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyMetrics {
    pub strategy: Strategy,
    pub timestamp: u64,
    /// Mean wall time of one `select`, in seconds.
    pub avg_selection_time: f64,
    pub selections: u64,
    pub success_rate: f64,
    pub load_balance_score: f64,
    pub resource_efficiency: f64,
    pub node_utilization: BTreeMap<WorkerId, f64>,
    pub transition_count: u64,
    pub last_transition: Option<u64>,
}

/// Latest records for every node plus the latest strategy record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub nodes: BTreeMap<WorkerId, NodeMetrics>,
    pub strategy: Option<StrategyMetrics>,
}

/// 1.0 for a healthy worker; each saturated signal multiplies a penalty in.
pub fn health_score(worker: &Worker) -> f64 {
    let mut score = 1.0;
    if worker.current_load > 0.9 {
        score *= 0.5;
    }
    if worker.usage.cpu > 0.9 {
        score *= 0.7;
    }
    if worker.usage.memory > 0.9 {
        score *= 0.7;
    }
    if worker.usage.network_latency > 0.5 {
        score *= 0.8;
    }
    score
}

/// How well the active strategy is doing for one worker, in 0.0..=1.0.
///
/// Strategies without a per-node signal score 1.0.
pub fn strategy_effectiveness(strategy: Strategy, worker: &Worker, predicted: Option<f64>) -> f64 {
    let score = match strategy {
        Strategy::WeightedRoundRobin | Strategy::LeastLoad => 1.0,
        Strategy::LeastConnections => 1.0 - f64::from(worker.active_connections) / 100.0,
        Strategy::ResponseTime => 1.0 - worker.mean_response_time().unwrap_or(1.0).min(1.0),
        Strategy::Predictive => {
            1.0 - (worker.current_load - predicted.unwrap_or(worker.current_load)).abs()
        }
    };
    score.clamp(0.0, 1.0)
}

/// 1 − spread of loads across workers. A single worker is perfectly
/// balanced.
pub fn load_balance_score(loads: &[f64]) -> f64 {
    if loads.len() <= 1 {
        return 1.0;
    }
    (1.0 - sample_std_dev(loads)).max(0.0)
}

/// Node-level samples used for resource efficiency.
const EFFICIENCY_SAMPLES: usize = 10;

#[derive(Debug, Default)]
struct Window {
    selection_secs: Vec<f64>,
    selections: HashMap<WorkerId, u64>,
    errors: HashMap<WorkerId, u64>,
}

/// Mutable metrics state owned by the balancer.
#[derive(Debug)]
pub(crate) struct MetricsState {
    limit: usize,
    window: Window,
    node_history: HashMap<WorkerId, VecDeque<NodeMetrics>>,
    strategy_history: VecDeque<StrategyMetrics>,
    pub(crate) transition_count: u64,
    pub(crate) last_transition: Option<u64>,
}

impl MetricsState {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            window: Window::default(),
            node_history: HashMap::new(),
            strategy_history: VecDeque::new(),
            transition_count: 0,
            last_transition: None,
        }
    }

    pub(crate) fn record_selection(&mut self, worker_id: &str, secs: f64) {
        self.window.selection_secs.push(secs);
        *self
            .window
            .selections
            .entry(worker_id.to_string())
            .or_default() += 1;
    }

    pub(crate) fn record_error(&mut self, worker_id: &str) {
        *self.window.errors.entry(worker_id.to_string()).or_default() += 1;
    }

    fn node_error_rate(&self, worker_id: &str) -> f64 {
        let selections = self.window.selections.get(worker_id).copied().unwrap_or(0);
        let errors = self.window.errors.get(worker_id).copied().unwrap_or(0);
        if selections == 0 {
            return if errors > 0 { 1.0 } else { 0.0 };
        }
        (errors as f64 / selections as f64).min(1.0)
    }

    pub(crate) fn push_node(&mut self, worker: &Worker, stats: NodeStats, strategy: Strategy, now: u64) {
        let record = NodeMetrics {
            node_id: worker.id.clone(),
            timestamp: now,
            strategy_effectiveness: strategy_effectiveness(strategy, worker, stats.predicted_load),
            resource_utilization: worker.resource_utilization(),
            error_rate: self.node_error_rate(&worker.id),
            health_score: health_score(worker),
            stats,
        };
        let history = self.node_history.entry(worker.id.clone()).or_default();
        history.push_back(record);
        while history.len() > self.limit {
            history.pop_front();
        }
    }

    /// Drop history for workers no longer registered.
    pub(crate) fn retain_nodes(&mut self, live: &[Worker]) {
        self.node_history
            .retain(|id, _| live.iter().any(|w| &w.id == id));
    }

    /// Close the current window into a strategy record and start a new one.
    pub(crate) fn close_window(&mut self, strategy: Strategy, workers: &[Worker], now: u64) -> StrategyMetrics {
        let selections: u64 = self.window.selections.values().sum();
        let errors: u64 = self.window.errors.values().sum();
        let success_rate = if selections == 0 {
            1.0
        } else {
            (1.0 - errors as f64 / selections as f64).max(0.0)
        };

        let loads: Vec<f64> = workers.iter().map(|w| w.current_load).collect();
        let efficiency: Vec<f64> = self
            .node_history
            .values()
            .flat_map(|h| h.iter().rev().take(EFFICIENCY_SAMPLES))
            .map(|m| m.resource_utilization)
            .collect();

        let record = StrategyMetrics {
            strategy,
            timestamp: now,
            avg_selection_time: mean(&self.window.selection_secs),
            selections,
            success_rate,
            load_balance_score: load_balance_score(&loads),
            resource_efficiency: mean(&efficiency),
            node_utilization: workers
                .iter()
                .map(|w| (w.id.clone(), w.current_load))
                .collect(),
            transition_count: self.transition_count,
            last_transition: self.last_transition,
        };

        self.strategy_history.push_back(record.clone());
        while self.strategy_history.len() > self.limit {
            self.strategy_history.pop_front();
        }
        self.window = Window::default();
        record
    }

    pub(crate) fn latest(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            nodes: self
                .node_history
                .iter()
                .filter_map(|(id, h)| h.back().map(|m| (id.clone(), m.clone())))
                .collect(),
            strategy: self.strategy_history.back().cloned(),
        }
    }

    pub(crate) fn latest_timestamp(&self) -> Option<u64> {
        self.strategy_history.back().map(|m| m.timestamp)
    }

    pub(crate) fn node_history(&self, worker_id: &str) -> Vec<NodeMetrics> {
        self.node_history
            .get(worker_id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn strategy_history_len(&self) -> usize {
        self.strategy_history.len()
    }
}
