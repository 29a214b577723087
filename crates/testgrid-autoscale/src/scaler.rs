//! Autoscaler — utilization-driven fleet scaling.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use testgrid_core::lifecycle::{BackgroundTask, run_periodic};
use testgrid_core::time::epoch_millis;
use testgrid_registry::WorkerRegistry;
use testgrid_scheduler::TaskScheduler;

use crate::config::AutoscaleConfig;
use crate::provider::{FleetProvider, FleetStatus};

/// Fleet and queue state sampled on one monitoring tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScalingSnapshot {
    pub worker_count: usize,
    pub available_workers: usize,
    pub pending_tasks: usize,
    pub running_tasks: usize,
    /// Rolling mean task duration in seconds.
    pub avg_task_duration: f64,
    pub worker_utilization: f64,
    /// Epoch milliseconds.
    pub timestamp: u64,
    #[serde(skip)]
    pub taken_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum ScaleDecision {
    ScaleUp { by: usize, target: usize },
    ScaleDown { by: usize, target: usize },
    NoChange,
}

impl ScaleDecision {
    pub fn target(self) -> Option<usize> {
        match self {
            ScaleDecision::ScaleUp { target, .. } | ScaleDecision::ScaleDown { target, .. } => {
                Some(target)
            }
            ScaleDecision::NoChange => None,
        }
    }
}

/// What the autoscaler currently knows, for status output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScalingReport {
    pub latest: Option<ScalingSnapshot>,
    pub snapshots: usize,
    /// Epoch milliseconds of the last successful scaling call.
    pub last_scaled_at: Option<u64>,
    pub last_decision: Option<ScaleDecision>,
    pub in_cooldown: bool,
    pub cooldown_secs: u64,
    pub metrics_window_secs: u64,
    pub fleet: Option<FleetStatus>,
}

/// Decide on a scaling action for one snapshot, ignoring cooldown.
pub fn evaluate(config: &AutoscaleConfig, snapshot: &ScalingSnapshot) -> ScaleDecision {
    let current = snapshot.worker_count;
    let utilization = snapshot.worker_utilization;

    if utilization > config.scale_up_threshold
        && snapshot.pending_tasks > 0
        && current < config.max_workers
    {
        let step = step(current, config.scale_up_factor);
        let by = (config.max_workers - current).min(step);
        return ScaleDecision::ScaleUp {
            by,
            target: current + by,
        };
    }

    if utilization < config.scale_down_threshold && current > config.min_workers {
        let step = step(current, config.scale_down_factor);
        let by = (current - config.min_workers).min(step);
        return ScaleDecision::ScaleDown {
            by,
            target: current - by,
        };
    }

    ScaleDecision::NoChange
}

/// `max(1, round(current × factor))`, rounding half away from zero.
fn step(current: usize, factor: f64) -> usize {
    ((current as f64 * factor).round() as usize).max(1)
}

#[derive(Default)]
struct ScalingState {
    last_scaled: Option<Instant>,
    last_scaled_epoch: Option<u64>,
    last_decision: Option<ScaleDecision>,
}

pub struct AutoScaler {
    registry: WorkerRegistry,
    scheduler: Arc<TaskScheduler>,
    provider: Arc<dyn FleetProvider>,
    config: AutoscaleConfig,
    history: Mutex<VecDeque<ScalingSnapshot>>,
    /// Held across evaluate + provision so overlapping ticks cannot both act.
    scaling: Mutex<ScalingState>,
    monitor: BackgroundTask,
}

impl AutoScaler {
    pub fn new(
        registry: WorkerRegistry,
        scheduler: Arc<TaskScheduler>,
        provider: Arc<dyn FleetProvider>,
        config: AutoscaleConfig,
    ) -> Self {
        Self {
            registry,
            scheduler,
            provider,
            config,
            history: Mutex::new(VecDeque::new()),
            scaling: Mutex::new(ScalingState::default()),
            monitor: BackgroundTask::new("autoscale-monitor"),
        }
    }

    pub fn config(&self) -> &AutoscaleConfig {
        &self.config
    }

    /// Sample the fleet and queue, append the snapshot and prune old ones.
    pub async fn collect_snapshot(&self) -> ScalingSnapshot {
        let worker_count = self.registry.worker_count().await;
        let available_workers = self.registry.available().await.len();
        let counts = self.scheduler.counts().await;
        let worker_utilization = if worker_count == 0 {
            0.0
        } else {
            worker_count.saturating_sub(available_workers) as f64 / worker_count as f64
        };

        let snapshot = ScalingSnapshot {
            worker_count,
            available_workers,
            pending_tasks: counts.pending,
            running_tasks: counts.running,
            avg_task_duration: self.scheduler.mean_task_duration().await,
            worker_utilization,
            timestamp: epoch_millis(),
            taken_at: Instant::now(),
        };

        let mut history = self.history.lock().await;
        history.push_back(snapshot.clone());
        let window = self.config.metrics_window;
        while history
            .front()
            .is_some_and(|s| s.taken_at.elapsed() > window)
        {
            history.pop_front();
        }
        snapshot
    }

    /// One monitoring tick. Returns the action requested from the provider,
    /// or `NoChange` when nothing was requested.
    pub async fn tick(&self) -> ScaleDecision {
        let snapshot = self.collect_snapshot().await;
        let mut scaling = self.scaling.lock().await;

        if let Some(at) = scaling.last_scaled
            && at.elapsed() < self.config.cooldown
        {
            debug!(
                remaining_secs = (self.config.cooldown - at.elapsed()).as_secs(),
                "in scaling cooldown"
            );
            return ScaleDecision::NoChange;
        }

        let decision = evaluate(&self.config, &snapshot);
        let Some(target) = decision.target() else {
            return decision;
        };

        info!(
            ?decision,
            utilization = snapshot.worker_utilization,
            pending = snapshot.pending_tasks,
            workers = snapshot.worker_count,
            "requesting fleet change"
        );
        match self.provider.scale_to(target).await {
            Ok(()) => {
                scaling.last_scaled = Some(Instant::now());
                scaling.last_scaled_epoch = Some(epoch_millis());
                scaling.last_decision = Some(decision);
            }
            Err(e) => {
                warn!(target, error = %e, "fleet scaling failed, will retry next tick");
            }
        }
        decision
    }

    pub async fn in_cooldown(&self) -> bool {
        let scaling = self.scaling.lock().await;
        scaling
            .last_scaled
            .is_some_and(|at| at.elapsed() < self.config.cooldown)
    }

    pub async fn history(&self) -> Vec<ScalingSnapshot> {
        self.history.lock().await.iter().cloned().collect()
    }

    pub async fn scaling_report(&self) -> ScalingReport {
        let (latest, snapshots) = {
            let history = self.history.lock().await;
            (history.back().cloned(), history.len())
        };
        let (last_scaled_at, last_decision) = {
            let scaling = self.scaling.lock().await;
            (scaling.last_scaled_epoch, scaling.last_decision)
        };
        let fleet = match self.provider.status().await {
            Ok(status) => Some(status),
            Err(e) => {
                warn!(error = %e, "fleet status unavailable");
                None
            }
        };

        ScalingReport {
            latest,
            snapshots,
            last_scaled_at,
            last_decision,
            in_cooldown: self.in_cooldown().await,
            cooldown_secs: self.config.cooldown.as_secs(),
            metrics_window_secs: self.config.metrics_window.as_secs(),
            fleet,
        }
    }

    /// Start the monitoring loop. No-op when disabled or already running.
    pub async fn start_monitoring(self: &Arc<Self>) -> bool {
        if !self.config.enabled {
            info!("autoscaling disabled");
            return false;
        }
        let scaler = Arc::clone(self);
        let interval = self.config.interval;
        self.monitor
            .start(move |shutdown| async move {
                run_periodic("autoscale-monitor", interval, shutdown, || {
                    let scaler = scaler.clone();
                    async move {
                        scaler.tick().await;
                    }
                })
                .await;
            })
            .await
    }

    pub async fn stop_monitoring(&self) -> bool {
        self.monitor.stop().await
    }
}
