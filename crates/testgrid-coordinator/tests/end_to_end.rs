use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use testgrid_autoscale::{FleetProvider, ScaleDecision};
use testgrid_core::{Capabilities, ResultStatus, TaskResult, TaskSpec, TaskStatus, Worker};
use testgrid_coordinator::sim::{SimulatedExecutor, SimulatedFleet, fleet_capabilities, generate_plan, sim_workers};
use testgrid_coordinator::{Coordinator, GridConfig, ReportOutcome, TaskExecutor};
use testgrid_registry::WorkerRegistry;
use testgrid_scheduler::{Assignment, SchedulerError};

/// Never finishes; tasks stay in flight until something else ends them.
struct HangingExecutor;

#[async_trait]
impl TaskExecutor for HangingExecutor {
    async fn execute(&self, _assignment: &Assignment) -> TaskResult {
        std::future::pending::<TaskResult>().await
    }
}

fn caps(pairs: &[(&str, &str)]) -> Capabilities {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn worker(id: &str) -> Worker {
    Worker::new(id, format!("{id}.local:9000"), Capabilities::new())
}

fn hanging(config: GridConfig) -> Coordinator {
    Coordinator::new(config, Arc::new(HangingExecutor), None)
}

#[tokio::test]
async fn weighted_round_robin_favours_capable_worker() {
    let mut config = GridConfig::default();
    config.balancer.rng_seed = Some(42);
    let grid = hanging(config);

    grid.register_worker(Worker::new(
        "big",
        "big.local:9000",
        caps(&[("os", "linux"), ("memory", "16GB"), ("cpu_cores", "8")]),
    ))
    .await;
    grid.register_worker(worker("plain-a")).await;
    grid.register_worker(worker("plain-b")).await;
    let weights = grid.balancer().weights().await;

    // One task at a time so every worker is idle at each draw.
    let rounds = 200_u32;
    let mut picks: BTreeMap<String, u32> = BTreeMap::new();
    for i in 0..rounds {
        grid.submit(TaskSpec::new(format!("t{i}"), "unit")).await.unwrap();
        let assignments = grid.scheduler().dispatch().await;
        assert_eq!(assignments.len(), 1);
        let a = &assignments[0];
        *picks.entry(a.worker_id.clone()).or_default() += 1;
        let result = TaskResult::passed(&a.task_id, &a.worker_id, 0.1).with_attempt(a.attempt);
        assert_eq!(grid.report(result).await.unwrap(), ReportOutcome::Completed);
    }

    let share = |id: &str| f64::from(picks.get(id).copied().unwrap_or(0)) / f64::from(rounds);
    assert!(share("big") > share("plain-a"), "{picks:?}");
    assert!(share("big") > share("plain-b"), "{picks:?}");
    for (id, weight) in &weights {
        assert!(
            (share(id.as_str()) - weight).abs() < 0.12,
            "{id}: share {} against weight {weight}",
            share(id.as_str())
        );
    }
    assert!((weights["big"] - 2.34 / 4.34).abs() < 1e-9);
    assert_eq!(grid.results().result_count().await, rounds as usize);
}

#[tokio::test(start_paused = true)]
async fn simulated_run_completes_every_task() {
    let executor = SimulatedExecutor::new(5).with_mean_duration(Duration::from_millis(200));
    let grid = Coordinator::new(GridConfig::default(), Arc::new(executor), None);
    for w in sim_workers(3) {
        grid.register_worker(w).await;
    }
    grid.submit_all(generate_plan(30, 11)).await.unwrap();

    grid.start().await;
    assert!(grid.is_running().await);
    assert!(grid.wait_for_quiescence(Duration::from_secs(50)).await);
    grid.stop().await;
    assert!(!grid.is_running().await);

    let counts = grid.scheduler().counts().await;
    assert_eq!(counts.completed, 30);
    assert_eq!(counts.failed, 0);

    let overall = grid.results().overall_summary().await;
    assert_eq!(overall.counts.passed, 30);
    assert_eq!(overall.pass_rate, 100.0);

    let snapshot = grid.metrics_snapshot().await;
    assert_eq!(snapshot.workers, 3);
    assert_eq!(snapshot.tasks.completed, 30);
    assert!(snapshot.autoscale.is_none());
    let json = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(json["tasks"]["completed"], 30);
    assert_eq!(json["strategy"], "weighted_round_robin");
}

#[tokio::test(start_paused = true)]
async fn failing_tasks_exhaust_retries() {
    let mut config = GridConfig::default();
    config.scheduler.default_max_retries = 2;
    let executor = SimulatedExecutor::new(9).with_failure_rate(1.0);
    let grid = Coordinator::new(config, Arc::new(executor), None);
    grid.register_worker(worker("w1")).await;
    grid.submit(TaskSpec::new("flaky", "ui")).await.unwrap();
    grid.submit(TaskSpec::new("after", "ui").depends_on("flaky")).await.unwrap();

    grid.start().await;
    assert!(grid.wait_for_quiescence(Duration::from_secs(50)).await);
    grid.stop().await;

    let task = grid.scheduler().task("flaky").await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.last_error.as_deref(), Some("simulated failure"));
    assert_eq!(grid.results().results_for("flaky").await.len(), 3);

    let dependent = grid.scheduler().task("after").await.unwrap();
    assert_eq!(dependent.status, TaskStatus::Failed);

    let failed = grid.results().failed_tasks().await;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].task_id, "flaky");
    assert_eq!(failed[0].failures, 3);
}

#[tokio::test]
async fn lost_worker_tasks_are_requeued() {
    let grid = hanging(GridConfig::default());
    grid.register_worker(worker("w1")).await;
    grid.submit(TaskSpec::new("t1", "api")).await.unwrap();
    assert_eq!(grid.dispatch_once().await, 1);

    grid.register_worker(worker("w2")).await;
    assert!(grid.unregister_worker("w1").await.is_some());

    let task = grid.scheduler().task("t1").await.unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.retry_count, 1);

    let results = grid.results().results_for("t1").await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, ResultStatus::Error);
    assert_eq!(results[0].error.as_deref(), Some("worker w1 lost"));

    assert_eq!(grid.dispatch_once().await, 1);
    let task = grid.scheduler().task("t1").await.unwrap();
    assert_eq!(task.assigned_worker.as_deref(), Some("w2"));
}

#[tokio::test(start_paused = true)]
async fn timed_out_task_is_recorded_and_retried() {
    let grid = hanging(GridConfig::default());
    grid.register_worker(worker("w1")).await;
    grid.submit(TaskSpec::new("slow", "ui").with_timeout(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(grid.dispatch_once().await, 1);

    tokio::time::advance(Duration::from_secs(3)).await;
    // Reaps the timeout, then hands the task out again.
    assert_eq!(grid.dispatch_once().await, 1);

    let results = grid.results().results_for("slow").await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, ResultStatus::Error);
    assert!(results[0].error_message().starts_with("timed out after"));

    let task = grid.scheduler().task("slow").await.unwrap();
    assert_eq!(task.retry_count, 1);
    assert_eq!(task.assigned_worker.as_deref(), Some("w1"));

    // A late pass from the abandoned first attempt must not complete the retry.
    let err = grid
        .report(TaskResult::passed("slow", "w1", 3.0).with_attempt(0))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::StaleReport { .. }));
    assert_eq!(grid.results().results_for("slow").await.len(), 1);
    assert_eq!(grid.scheduler().counts().await.completed, 0);
}

#[tokio::test]
async fn stale_report_is_rejected_and_not_recorded() {
    let grid = hanging(GridConfig::default());
    grid.register_worker(worker("w1")).await;
    grid.submit(TaskSpec::new("t1", "api")).await.unwrap();
    grid.dispatch_once().await;

    let err = grid.report(TaskResult::passed("t1", "w9", 1.0)).await.unwrap_err();
    assert!(matches!(err, SchedulerError::StaleReport { .. }));
    assert_eq!(grid.results().result_count().await, 0);

    let err = grid.report(TaskResult::passed("ghost", "w1", 1.0)).await.unwrap_err();
    assert_eq!(err, SchedulerError::TaskNotFound("ghost".into()));
}

#[tokio::test]
async fn prometheus_lists_registered_nodes() {
    let grid = hanging(GridConfig::default());
    grid.register_worker(worker("w1")).await;
    grid.register_worker(worker("w2")).await;
    grid.balancer().refresh_metrics().await;

    let text = grid.render_prometheus().await;
    assert!(text.contains("testgrid_node_load{node=\"w1\"} 0.0000"));
    assert!(text.contains("testgrid_node_weight{node=\"w2\"} 0.5000"));
    assert!(text.contains("testgrid_strategy_success_rate{strategy=\"weighted_round_robin\"}"));
}

#[tokio::test]
async fn autoscaler_counts_workers_registered_before_the_fleet() {
    let config = GridConfig::default();
    let registry = WorkerRegistry::new(config.registry.clone());
    let fleet = Arc::new(SimulatedFleet::new(registry.clone(), fleet_capabilities()));
    let provider: Arc<dyn FleetProvider> = fleet.clone();
    let grid = Coordinator::with_registry(registry, config, Arc::new(HangingExecutor), Some(provider));

    for w in sim_workers(4) {
        grid.register_worker(w).await;
    }
    for i in 0..10 {
        grid.submit(TaskSpec::new(format!("t{i}"), "api")).await.unwrap();
    }
    assert_eq!(grid.dispatch_once().await, 4);

    let autoscaler = grid.autoscaler().unwrap();
    assert_eq!(autoscaler.tick().await, ScaleDecision::ScaleUp { by: 2, target: 6 });
    assert_eq!(grid.registry().worker_count().await, 6);
    assert_eq!(fleet.status().await.unwrap().current, 6);
}

#[tokio::test]
async fn autoscaler_grows_simulated_fleet_under_backlog() {
    let config = GridConfig::default();
    let registry = WorkerRegistry::new(config.registry.clone());
    let fleet = Arc::new(SimulatedFleet::new(registry.clone(), fleet_capabilities()));
    let provider: Arc<dyn FleetProvider> = fleet.clone();
    let grid = Coordinator::with_registry(registry, config, Arc::new(HangingExecutor), Some(provider));

    fleet.scale_to(1).await.unwrap();
    for i in 0..5 {
        grid.submit(TaskSpec::new(format!("t{i}"), "api")).await.unwrap();
    }
    assert_eq!(grid.dispatch_once().await, 1);

    let autoscaler = grid.autoscaler().unwrap();
    assert_eq!(autoscaler.tick().await, ScaleDecision::ScaleUp { by: 1, target: 2 });
    assert_eq!(grid.registry().worker_count().await, 2);

    // Cooldown holds the next request back.
    assert_eq!(autoscaler.tick().await, ScaleDecision::NoChange);

    let snapshot = grid.metrics_snapshot().await;
    let report = snapshot.autoscale.unwrap();
    assert!(report.in_cooldown);
    assert_eq!(report.fleet.map(|f| f.current), Some(2));
}
