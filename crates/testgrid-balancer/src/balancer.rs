//! The load balancer: picks a worker for each dispatchable task.
//!
//! All derived state (weights, predictions, strategy, metrics window) lives
//! behind one mutex. Callers that also hold the scheduler lock take it
//! first; the registry lock is always taken last.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::sync::Mutex;
use tracing::{debug, info};

use testgrid_core::lifecycle::{BackgroundTask, run_periodic};
use testgrid_core::time::epoch_millis;
use testgrid_core::{Capabilities, Worker, WorkerId, WorkerStatus, matches_requirements};
use testgrid_registry::{LoadUpdate, WorkerRegistry};

use crate::config::BalancerConfig;
use crate::metrics::{MetricsSnapshot, MetricsState, NodeMetrics, NodeStats};
use crate::predict::predict_load;
use crate::profiler::{Priority, Profiler, RecommendationKind};
use crate::select;
use crate::strategy::Strategy;
use crate::weights::compute_weights;

struct State {
    strategy: Strategy,
    weights: BTreeMap<WorkerId, f64>,
    predicted: HashMap<WorkerId, f64>,
    rng: StdRng,
    metrics: MetricsState,
}

impl State {
    fn transition(&mut self, to: Strategy) -> bool {
        if self.strategy == to {
            return false;
        }
        info!(from = %self.strategy, to = %to, "balancing strategy changed");
        self.strategy = to;
        self.metrics.transition_count += 1;
        self.metrics.last_transition = Some(epoch_millis());
        true
    }
}

pub struct LoadBalancer {
    registry: WorkerRegistry,
    config: BalancerConfig,
    profiler: Option<Arc<dyn Profiler>>,
    state: Mutex<State>,
    refresh: BackgroundTask,
}

impl LoadBalancer {
    pub fn new(registry: WorkerRegistry, config: BalancerConfig) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let state = State {
            strategy: config.initial_strategy(),
            weights: BTreeMap::new(),
            predicted: HashMap::new(),
            rng,
            metrics: MetricsState::new(config.history_limit),
        };
        Self {
            registry,
            config,
            profiler: None,
            state: Mutex::new(state),
            refresh: BackgroundTask::new("balancer-metrics"),
        }
    }

    pub fn with_profiler(mut self, profiler: Arc<dyn Profiler>) -> Self {
        self.profiler = Some(profiler);
        self
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn config(&self) -> &BalancerConfig {
        &self.config
    }

    pub async fn strategy(&self) -> Strategy {
        self.state.lock().await.strategy
    }

    /// Switch strategy. Returns `false` when `strategy` was already active.
    pub async fn set_strategy(&self, strategy: Strategy) -> bool {
        self.state.lock().await.transition(strategy)
    }

    /// Pick an available worker satisfying `requirements` using the active
    /// strategy. `None` when no worker qualifies.
    pub async fn select(&self, requirements: &Capabilities) -> Option<Worker> {
        let started = Instant::now();
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let workers = self.registry.list().await;
        if workers.is_empty() {
            debug!("no workers registered");
            return None;
        }
        state.weights = self.weights_for(&workers);

        let timeout = self.registry.config().heartbeat_timeout;
        let candidates: Vec<Worker> = workers
            .into_iter()
            .filter(|w| w.is_available(timeout) && matches_requirements(&w.capabilities, requirements))
            .collect();
        if candidates.is_empty() {
            debug!(?requirements, "no eligible worker");
            return None;
        }

        let picked = match state.strategy {
            Strategy::WeightedRoundRobin => {
                select::weighted(&candidates, &state.weights, &mut state.rng)
            }
            Strategy::LeastLoad => select::least_load(&candidates),
            Strategy::LeastConnections => select::least_connections(&candidates),
            Strategy::ResponseTime => select::fastest_response(&candidates),
            Strategy::Predictive => {
                for worker in &candidates {
                    let predicted = self.predict(worker);
                    state.predicted.insert(worker.id.clone(), predicted);
                }
                select::lowest_predicted(&candidates, &state.predicted)
            }
        }
        .cloned();

        if let Some(worker) = &picked {
            let elapsed = started.elapsed().as_secs_f64();
            state.metrics.record_selection(&worker.id, elapsed);
            debug!(worker_id = %worker.id, strategy = %state.strategy, "worker selected");
        }
        picked
    }

    /// Apply a load/usage update to the registry, feed the load sample to
    /// the profiler and refresh weights.
    pub async fn update_load(&self, worker_id: &str, update: &LoadUpdate) -> bool {
        let mut state = self.state.lock().await;
        if !self.registry.update_load(worker_id, update).await {
            return false;
        }
        if let (Some(profiler), Some(load)) = (&self.profiler, update.current_load) {
            profiler.record_load(worker_id, load);
        }
        let workers = self.registry.list().await;
        state.weights = self.weights_for(&workers);
        true
    }

    /// Feed the outcome of a task the balancer placed. Failures count
    /// against the strategy's success rate and the worker's error rate.
    pub async fn record_outcome(&self, worker_id: &str, success: bool) {
        if !success {
            self.state.lock().await.metrics.record_error(worker_id);
        }
    }

    /// Current normalized weights of all non-offline workers.
    pub async fn weights(&self) -> BTreeMap<WorkerId, f64> {
        let mut state = self.state.lock().await;
        let workers = self.registry.list().await;
        state.weights = self.weights_for(&workers);
        state.weights.clone()
    }

    /// Live per-worker stats.
    pub async fn node_stats(&self) -> BTreeMap<WorkerId, NodeStats> {
        let mut state = self.state.lock().await;
        let workers = self.registry.list().await;
        state.weights = self.weights_for(&workers);
        workers
            .iter()
            .map(|w| (w.id.clone(), Self::stats_of(w, &state)))
            .collect()
    }

    /// Ask the profiler for recommendations and switch strategy on a
    /// high-priority one. Returns the new strategy when it changed.
    pub async fn optimize_strategy(&self) -> Option<Strategy> {
        let profiler = self.profiler.as_ref()?;
        let mut state = self.state.lock().await;

        let mut target = None;
        for rec in profiler.recommend(state.strategy) {
            if rec.priority != Priority::High {
                continue;
            }
            match rec.kind {
                RecommendationKind::LoadBalancing => {
                    target = Some(match rec.suggestion.as_deref() {
                        Some("least_connections") => Strategy::LeastConnections,
                        Some("response_time") => Strategy::ResponseTime,
                        Some("predictive") => Strategy::Predictive,
                        _ => Strategy::LeastLoad,
                    });
                }
                RecommendationKind::Distribution => target = Some(Strategy::WeightedRoundRobin),
                RecommendationKind::QueueOptimization => {
                    debug!(message = %rec.message, "queue recommendation left to the scheduler");
                }
            }
        }

        let target = target?;
        state.transition(target).then_some(target)
    }

    /// Recompute every node record and close the strategy window.
    pub async fn refresh_metrics(&self) -> MetricsSnapshot {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let workers = self.registry.list().await;
        state.weights = self.weights_for(&workers);

        let now = epoch_millis();
        for worker in &workers {
            let stats = Self::stats_of(worker, state);
            state.metrics.push_node(worker, stats, state.strategy, now);
        }
        state.metrics.retain_nodes(&workers);
        state.predicted.retain(|id, _| workers.iter().any(|w| &w.id == id));
        state.metrics.close_window(state.strategy, &workers, now);
        state.metrics.latest()
    }

    /// Latest metrics, refreshed first when older than the metrics interval.
    pub async fn detailed_metrics(&self) -> MetricsSnapshot {
        let interval_ms = self.config.metrics_interval.as_millis() as u64;
        let stale = {
            let state = self.state.lock().await;
            state
                .metrics
                .latest_timestamp()
                .is_none_or(|ts| epoch_millis().saturating_sub(ts) >= interval_ms)
        };
        if stale {
            return self.refresh_metrics().await;
        }
        self.state.lock().await.metrics.latest()
    }

    pub async fn node_history(&self, worker_id: &str) -> Vec<NodeMetrics> {
        self.state.lock().await.metrics.node_history(worker_id)
    }

    /// Start the periodic metrics refresh, optionally followed by a strategy
    /// optimization. No-op if already running.
    pub async fn start_metrics_refresh(self: &Arc<Self>) -> bool {
        let balancer = Arc::clone(self);
        let interval = self.config.metrics_interval;
        self.refresh
            .start(move |shutdown| async move {
                run_periodic("balancer-metrics", interval, shutdown, || {
                    let balancer = balancer.clone();
                    async move {
                        balancer.refresh_metrics().await;
                        if balancer.config.auto_optimize {
                            balancer.optimize_strategy().await;
                        }
                    }
                })
                .await;
            })
            .await
    }

    pub async fn stop_metrics_refresh(&self) -> bool {
        self.refresh.stop().await
    }

    // ── Internal helpers ────────────────────────────────────────────

    fn weights_for(&self, workers: &[Worker]) -> BTreeMap<WorkerId, f64> {
        compute_weights(workers, &self.config.capability_bonuses, self.config.load_epsilon)
    }

    /// Extrapolate the worker's load from the profiler's recent samples.
    fn predict(&self, worker: &Worker) -> f64 {
        let Some(profiler) = &self.profiler else {
            return worker.current_load;
        };
        let samples: Vec<f64> = (0..self.config.prediction_window)
            .rev()
            .filter_map(|offset| profiler.recent_load(&worker.id, offset))
            .collect();
        if samples.len() < 2 {
            debug!(worker_id = %worker.id, samples = samples.len(), "too little load history to fit a trend");
        }
        predict_load(worker.current_load, &samples, self.config.prediction_horizon)
    }

    fn stats_of(worker: &Worker, state: &State) -> NodeStats {
        let weight = if worker.status == WorkerStatus::Offline {
            0.0
        } else {
            state.weights.get(&worker.id).copied().unwrap_or(0.0)
        };
        NodeStats {
            current_load: worker.current_load,
            cpu_usage: worker.usage.cpu,
            memory_usage: worker.usage.memory,
            network_latency: worker.usage.network_latency,
            active_connections: worker.active_connections,
            avg_response_time: worker.mean_response_time(),
            predicted_load: state.predicted.get(&worker.id).copied(),
            weight,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use testgrid_registry::RegistryConfig;

    use crate::profiler::{Recommendation, RecordingProfiler};

    fn caps(pairs: &[(&str, &str)]) -> Capabilities {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    async fn balancer_with(strategy: Strategy, workers: &[(&str, f64)]) -> LoadBalancer {
        let registry = WorkerRegistry::new(RegistryConfig::default());
        for (id, load) in workers {
            let mut worker = Worker::new(*id, "local", Capabilities::new());
            worker.current_load = *load;
            registry.register(worker).await;
        }
        LoadBalancer::new(
            registry,
            BalancerConfig {
                strategy: strategy.to_string(),
                rng_seed: Some(42),
                ..BalancerConfig::default()
            },
        )
    }

    /// Returns one fixed recommendation.
    struct FixedProfiler(Vec<Recommendation>);

    impl Profiler for FixedProfiler {
        fn recent_load(&self, _node_id: &str, _offset: usize) -> Option<f64> {
            None
        }

        fn recommend(&self, _current: Strategy) -> Vec<Recommendation> {
            self.0.clone()
        }
    }

    fn recommendation(kind: RecommendationKind, priority: Priority, suggestion: &str) -> Recommendation {
        Recommendation {
            kind,
            priority,
            suggestion: Some(suggestion.to_string()),
            message: String::new(),
        }
    }

    #[tokio::test]
    async fn empty_registry_selects_nothing() {
        let balancer = balancer_with(Strategy::WeightedRoundRobin, &[]).await;
        assert!(balancer.select(&Capabilities::new()).await.is_none());
    }

    #[tokio::test]
    async fn requirements_filter_candidates() {
        let balancer = balancer_with(Strategy::LeastLoad, &[("a", 0.0)]).await;
        let mut gpu = Worker::new("b", "local", caps(&[("gpu", "yes")]));
        gpu.current_load = 0.8;
        balancer.registry().register(gpu).await;

        let picked = balancer.select(&caps(&[("gpu", "yes")])).await.unwrap();
        assert_eq!(picked.id, "b");
        assert!(balancer.select(&caps(&[("gpu", "no")])).await.is_none());
    }

    #[tokio::test]
    async fn busy_workers_are_skipped() {
        let balancer = balancer_with(Strategy::LeastLoad, &[("a", 0.0), ("b", 0.5)]).await;
        balancer.registry().set_status("a", WorkerStatus::Busy).await;

        assert_eq!(balancer.select(&Capabilities::new()).await.unwrap().id, "b");
    }

    #[tokio::test]
    async fn least_load_picks_lowest() {
        let balancer = balancer_with(Strategy::LeastLoad, &[("a", 0.6), ("b", 0.2), ("c", 0.4)]).await;
        assert_eq!(balancer.select(&Capabilities::new()).await.unwrap().id, "b");
    }

    #[tokio::test]
    async fn predictive_avoids_rising_load() {
        let registry = WorkerRegistry::new(RegistryConfig::default());
        let mut rising = Worker::new("a", "local", Capabilities::new());
        rising.current_load = 0.3;
        let mut flat = Worker::new("b", "local", Capabilities::new());
        flat.current_load = 0.5;
        registry.register(rising).await;
        registry.register(flat).await;

        let profiler = Arc::new(RecordingProfiler::new(100));
        for i in 0..10 {
            profiler.record_load("a", 0.05 * i as f64);
            profiler.record_load("b", 0.5);
        }
        let balancer = LoadBalancer::new(
            registry,
            BalancerConfig {
                strategy: "predictive".to_string(),
                ..BalancerConfig::default()
            },
        )
        .with_profiler(profiler);

        assert_eq!(balancer.select(&Capabilities::new()).await.unwrap().id, "b");
        let stats = balancer.node_stats().await;
        assert!((stats["a"].predicted_load.unwrap() - 0.8).abs() < 1e-9);
        assert_eq!(stats["b"].predicted_load, Some(0.5));
    }

    #[tokio::test]
    async fn update_load_shifts_weights() {
        let balancer = balancer_with(Strategy::WeightedRoundRobin, &[("a", 0.0), ("b", 0.0)]).await;
        let before = balancer.weights().await;
        assert!((before["a"] - 0.5).abs() < 1e-9);

        assert!(balancer.update_load("a", &LoadUpdate::load(0.9)).await);
        let after = balancer.weights().await;
        assert!(after["a"] < after["b"]);
        assert!(!balancer.update_load("ghost", &LoadUpdate::load(0.1)).await);
    }

    #[tokio::test]
    async fn high_priority_load_balancing_switches_strategy() {
        let profiler = FixedProfiler(vec![recommendation(
            RecommendationKind::LoadBalancing,
            Priority::High,
            "least_connections",
        )]);
        let balancer = balancer_with(Strategy::WeightedRoundRobin, &[("a", 0.0)])
            .await
            .with_profiler(Arc::new(profiler));

        assert_eq!(balancer.optimize_strategy().await, Some(Strategy::LeastConnections));
        assert_eq!(balancer.strategy().await, Strategy::LeastConnections);

        // Same recommendation again: no transition.
        assert_eq!(balancer.optimize_strategy().await, None);
        let metrics = balancer.refresh_metrics().await;
        assert_eq!(metrics.strategy.unwrap().transition_count, 1);
    }

    #[tokio::test]
    async fn unknown_suggestion_maps_to_least_load() {
        let profiler = FixedProfiler(vec![recommendation(
            RecommendationKind::LoadBalancing,
            Priority::High,
            "round_robin_deluxe",
        )]);
        let balancer = balancer_with(Strategy::Predictive, &[("a", 0.0)])
            .await
            .with_profiler(Arc::new(profiler));
        assert_eq!(balancer.optimize_strategy().await, Some(Strategy::LeastLoad));
    }

    #[tokio::test]
    async fn distribution_switches_to_weighted() {
        let profiler = FixedProfiler(vec![recommendation(
            RecommendationKind::Distribution,
            Priority::High,
            "",
        )]);
        let balancer = balancer_with(Strategy::LeastLoad, &[("a", 0.0)])
            .await
            .with_profiler(Arc::new(profiler));
        assert_eq!(balancer.optimize_strategy().await, Some(Strategy::WeightedRoundRobin));
    }

    #[tokio::test]
    async fn medium_priority_is_ignored() {
        let profiler = FixedProfiler(vec![recommendation(
            RecommendationKind::LoadBalancing,
            Priority::Medium,
            "response_time",
        )]);
        let balancer = balancer_with(Strategy::LeastLoad, &[("a", 0.0)])
            .await
            .with_profiler(Arc::new(profiler));
        assert_eq!(balancer.optimize_strategy().await, None);
        assert_eq!(balancer.strategy().await, Strategy::LeastLoad);
    }

    #[tokio::test]
    async fn no_profiler_no_optimization() {
        let balancer = balancer_with(Strategy::LeastLoad, &[("a", 0.0)]).await;
        assert_eq!(balancer.optimize_strategy().await, None);
    }

    #[tokio::test]
    async fn failed_outcomes_lower_success_rate() {
        let balancer = balancer_with(Strategy::LeastLoad, &[("a", 0.0)]).await;
        for _ in 0..4 {
            balancer.select(&Capabilities::new()).await.unwrap();
        }
        balancer.record_outcome("a", false).await;
        balancer.record_outcome("a", true).await;

        let metrics = balancer.refresh_metrics().await;
        let strategy = metrics.strategy.unwrap();
        assert_eq!(strategy.selections, 4);
        assert!((strategy.success_rate - 0.75).abs() < 1e-9);
        assert!((metrics.nodes["a"].error_rate - 0.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn removed_workers_leave_metrics() {
        let balancer = balancer_with(Strategy::LeastLoad, &[("a", 0.0), ("b", 0.0)]).await;
        balancer.refresh_metrics().await;
        balancer.registry().unregister("b").await;

        let metrics = balancer.refresh_metrics().await;
        assert!(metrics.nodes.contains_key("a"));
        assert!(!metrics.nodes.contains_key("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn metrics_loop_refreshes_periodically() {
        let registry = WorkerRegistry::new(RegistryConfig::default());
        registry.register(Worker::new("a", "local", Capabilities::new())).await;
        let balancer = Arc::new(LoadBalancer::new(
            registry,
            BalancerConfig {
                metrics_interval: Duration::from_secs(1),
                ..BalancerConfig::default()
            },
        ));

        assert!(balancer.start_metrics_refresh().await);
        assert!(!balancer.start_metrics_refresh().await);
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(balancer.node_history("a").await.len(), 3);
        assert!(balancer.stop_metrics_refresh().await);
    }
}
