//! The coordinator: builds every component from a `GridConfig`, runs the
//! background loops and routes reports between components.

use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Notify, watch};
use tracing::{debug, info, warn};

use testgrid_autoscale::{AutoScaler, FleetProvider, ScalingReport};
use testgrid_balancer::{
    LoadBalancer, MetricsSnapshot, Profiler, RecordingProfiler, Strategy, render_prometheus,
};
use testgrid_core::lifecycle::BackgroundTask;
use testgrid_core::{TaskResult, TaskSpec, Worker};
use testgrid_registry::{BoxFuture, LoadUpdate, WorkerLostCallback, WorkerRegistry};
use testgrid_results::{OverallSummary, ResultAggregator};
use testgrid_scheduler::{
    Assignment, FailureOutcome, SchedulerCounts, SchedulerResult, TaskScheduler,
};

use crate::config::GridConfig;
use crate::executor::TaskExecutor;

/// How the scheduler took a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ReportOutcome {
    Completed,
    Retrying { attempt: u32 },
    Failed { error: String },
}

impl From<FailureOutcome> for ReportOutcome {
    fn from(outcome: FailureOutcome) -> Self {
        match outcome {
            FailureOutcome::Retrying { attempt } => ReportOutcome::Retrying { attempt },
            FailureOutcome::Failed { error } => ReportOutcome::Failed { error },
        }
    }
}

/// Nested metrics export for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct GridSnapshot {
    pub workers: usize,
    pub active_workers: usize,
    pub strategy: Strategy,
    pub tasks: SchedulerCounts,
    pub mean_task_duration: f64,
    pub balancer: MetricsSnapshot,
    pub results: OverallSummary,
    pub autoscale: Option<ScalingReport>,
}

struct Inner {
    config: GridConfig,
    registry: WorkerRegistry,
    balancer: Arc<LoadBalancer>,
    scheduler: Arc<TaskScheduler>,
    autoscaler: Option<Arc<AutoScaler>>,
    results: Arc<ResultAggregator>,
    profiler: Arc<RecordingProfiler>,
    executor: Arc<dyn TaskExecutor>,
    wake: Arc<Notify>,
    dispatcher: BackgroundTask,
}

/// Cheap-to-clone handle to a running grid.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    /// Build the grid. Autoscaling is only wired when a fleet provider is
    /// given.
    pub fn new(
        config: GridConfig,
        executor: Arc<dyn TaskExecutor>,
        fleet: Option<Arc<dyn FleetProvider>>,
    ) -> Self {
        let registry = WorkerRegistry::new(config.registry.clone());
        Self::with_registry(registry, config, executor, fleet)
    }

    /// Build the grid around an existing registry, for fleet providers that
    /// register workers themselves. The registry keeps its own config.
    pub fn with_registry(
        registry: WorkerRegistry,
        config: GridConfig,
        executor: Arc<dyn TaskExecutor>,
        fleet: Option<Arc<dyn FleetProvider>>,
    ) -> Self {
        let profiler = Arc::new(RecordingProfiler::new(config.balancer.history_limit));
        let balancer = Arc::new(
            LoadBalancer::new(registry.clone(), config.balancer.clone())
                .with_profiler(profiler.clone()),
        );
        let scheduler = Arc::new(TaskScheduler::new(balancer.clone(), config.scheduler.clone()));
        let results = Arc::new(ResultAggregator::new());
        let wake = Arc::new(Notify::new());

        registry.on_worker_lost(worker_lost_callback(
            Arc::downgrade(&scheduler),
            results.clone(),
            profiler.clone(),
            wake.clone(),
        ));

        let autoscaler = fleet.map(|provider| {
            Arc::new(AutoScaler::new(
                registry.clone(),
                scheduler.clone(),
                provider,
                config.autoscale.clone(),
            ))
        });

        info!(
            strategy = %balancer.config().initial_strategy(),
            autoscale = autoscaler.is_some(),
            "coordinator initialized"
        );
        Self {
            inner: Arc::new(Inner {
                config,
                registry,
                balancer,
                scheduler,
                autoscaler,
                results,
                profiler,
                executor,
                wake,
                dispatcher: BackgroundTask::new("dispatch"),
            }),
        }
    }

    pub fn config(&self) -> &GridConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.inner.registry
    }

    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.inner.balancer
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.inner.scheduler
    }

    pub fn results(&self) -> &Arc<ResultAggregator> {
        &self.inner.results
    }

    pub fn autoscaler(&self) -> Option<&Arc<AutoScaler>> {
        self.inner.autoscaler.as_ref()
    }

    // ── Workers ─────────────────────────────────────────────────────

    pub async fn register_worker(&self, worker: Worker) {
        self.inner.profiler.record_load(&worker.id, worker.current_load);
        self.inner.registry.register(worker).await;
        self.inner.wake.notify_one();
    }

    /// Remove a worker. Tasks it held are requeued through the worker-lost
    /// callback.
    pub async fn unregister_worker(&self, worker_id: &str) -> Option<Worker> {
        self.inner.registry.unregister(worker_id).await
    }

    pub async fn heartbeat(&self, worker_id: &str) -> bool {
        self.inner.registry.heartbeat(worker_id).await
    }

    pub async fn update_load(&self, worker_id: &str, update: &LoadUpdate) -> bool {
        let updated = self.inner.balancer.update_load(worker_id, update).await;
        if updated {
            self.inner.wake.notify_one();
        }
        updated
    }

    // ── Tasks ───────────────────────────────────────────────────────

    pub async fn submit(&self, spec: TaskSpec) -> SchedulerResult<()> {
        self.inner.scheduler.submit(spec).await?;
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Submit a batch, stopping at the first rejected task.
    pub async fn submit_all(&self, specs: impl IntoIterator<Item = TaskSpec>) -> SchedulerResult<usize> {
        let mut submitted = 0;
        for spec in specs {
            self.inner.scheduler.submit(spec).await?;
            submitted += 1;
        }
        self.inner.wake.notify_one();
        Ok(submitted)
    }

    /// Route a worker's report to the scheduler, then record it.
    ///
    /// Passed results complete the task; failed or errored ones count as a
    /// failed attempt. Reports from a worker or attempt that no longer holds
    /// the task are rejected and not recorded.
    pub async fn report(&self, result: TaskResult) -> SchedulerResult<ReportOutcome> {
        let inner = &self.inner;
        let success = result.status.is_success();
        let worker_id = result.worker_id.clone();

        let outcome = if success {
            inner.scheduler.complete(result.clone()).await?;
            ReportOutcome::Completed
        } else {
            inner
                .scheduler
                .fail(&result.task_id, &worker_id, result.attempt, result.error_message())
                .await?
                .into()
        };

        inner.results.add_result(result).await;
        inner.balancer.record_outcome(&worker_id, success).await;
        if let Some(worker) = inner.registry.get(&worker_id).await {
            inner.profiler.record_load(&worker.id, worker.current_load);
        }
        inner.wake.notify_one();
        Ok(outcome)
    }

    // ── Dispatch ────────────────────────────────────────────────────

    /// Reap timed-out tasks, run one dispatch pass and launch every
    /// assignment. Returns the number of tasks launched.
    pub async fn dispatch_once(&self) -> usize {
        let inner = &self.inner;
        for timed_out in inner.scheduler.reap_timed_out().await {
            warn!(
                task_id = %timed_out.task_id,
                worker_id = %timed_out.worker_id,
                elapsed_secs = timed_out.elapsed.as_secs_f64(),
                outcome = ?timed_out.outcome,
                "task timed out"
            );
            let result = TaskResult::errored(
                &timed_out.task_id,
                &timed_out.worker_id,
                timed_out.elapsed.as_secs_f64(),
                format!("timed out after {:.1}s", timed_out.elapsed.as_secs_f64()),
            );
            inner.results.add_result(result).await;
            inner.balancer.record_outcome(&timed_out.worker_id, false).await;
        }

        let assignments = inner.scheduler.dispatch().await;
        let launched = assignments.len();
        for assignment in assignments {
            inner
                .profiler
                .record_execution(&assignment.worker_id, assignment.queued_for.as_secs_f64());
            self.launch(assignment);
        }
        launched
    }

    /// Hand an assignment to the executor without waiting for it.
    fn launch(&self, assignment: Assignment) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let inner = &coordinator.inner;
            if let Err(e) = inner
                .scheduler
                .mark_running(&assignment.task_id, &assignment.worker_id, assignment.attempt)
                .await
            {
                debug!(task_id = %assignment.task_id, error = %e, "assignment withdrawn before start");
                return;
            }

            // Stamp the attempt so a late report from an abandoned attempt is
            // told apart from the live one.
            let result = inner
                .executor
                .execute(&assignment)
                .await
                .with_attempt(assignment.attempt);
            if let Err(e) = coordinator.report(result).await {
                warn!(task_id = %assignment.task_id, worker_id = %assignment.worker_id, error = %e, "report rejected");
            }
        });
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Start every background loop. Loops already running are left alone.
    pub async fn start(&self) {
        let inner = &self.inner;
        inner.registry.start_sweep().await;
        inner.balancer.start_metrics_refresh().await;
        if let Some(autoscaler) = &inner.autoscaler {
            autoscaler.start_monitoring().await;
        }

        let coordinator = self.clone();
        let interval = inner.config.scheduler.dispatch_interval;
        inner
            .dispatcher
            .start(move |shutdown| coordinator.dispatch_loop(interval, shutdown))
            .await;
    }

    /// Stop every background loop. In-flight executions keep running and
    /// their reports are still accepted.
    pub async fn stop(&self) {
        let inner = &self.inner;
        inner.dispatcher.stop().await;
        if let Some(autoscaler) = &inner.autoscaler {
            autoscaler.stop_monitoring().await;
        }
        inner.balancer.stop_metrics_refresh().await;
        inner.registry.stop_sweep().await;
        info!("coordinator stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.inner.dispatcher.is_running().await
    }

    async fn dispatch_loop(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let wake = self.inner.wake.clone();
        loop {
            tokio::select! {
                _ = wake.notified() => {}
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    debug!("dispatch loop shutting down");
                    break;
                }
            }
            self.dispatch_once().await;
        }
    }

    /// Wait until every submitted task is terminal, or `timeout` elapses.
    pub async fn wait_for_quiescence(&self, timeout: Duration) -> bool {
        let poll = Duration::from_millis(10);
        let drained = async {
            while !self.inner.scheduler.is_drained().await {
                tokio::time::sleep(poll).await;
            }
        };
        tokio::time::timeout(timeout, drained).await.is_ok()
    }

    // ── Metrics ─────────────────────────────────────────────────────

    pub async fn metrics_snapshot(&self) -> GridSnapshot {
        let inner = &self.inner;
        let autoscale = match &inner.autoscaler {
            Some(autoscaler) => Some(autoscaler.scaling_report().await),
            None => None,
        };
        GridSnapshot {
            workers: inner.registry.worker_count().await,
            active_workers: inner.registry.active_worker_count().await,
            strategy: inner.balancer.strategy().await,
            tasks: inner.scheduler.counts().await,
            mean_task_duration: inner.scheduler.mean_task_duration().await,
            balancer: inner.balancer.detailed_metrics().await,
            results: inner.results.overall_summary().await,
            autoscale,
        }
    }

    pub async fn render_prometheus(&self) -> String {
        render_prometheus(&self.inner.balancer.detailed_metrics().await)
    }
}

/// Requeue the tasks of a removed worker and record the lost attempts.
///
/// Holds the scheduler weakly: the registry owns this callback and the
/// scheduler reaches the registry through the balancer.
fn worker_lost_callback(
    scheduler: Weak<TaskScheduler>,
    results: Arc<ResultAggregator>,
    profiler: Arc<RecordingProfiler>,
    wake: Arc<Notify>,
) -> WorkerLostCallback {
    Arc::new(move |worker: Worker| -> BoxFuture {
        let scheduler = scheduler.clone();
        let results = results.clone();
        let profiler = profiler.clone();
        let wake = wake.clone();
        Box::pin(async move {
            profiler.forget(&worker.id);
            let Some(scheduler) = scheduler.upgrade() else {
                return;
            };
            let lost = scheduler.handle_worker_lost(&worker.id).await;
            for (task_id, _) in &lost {
                let result = TaskResult::errored(task_id, &worker.id, 0.0, format!("worker {} lost", worker.id));
                results.add_result(result).await;
            }
            if !lost.is_empty() {
                wake.notify_one();
            }
        })
    })
}
