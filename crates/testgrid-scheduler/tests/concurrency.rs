use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use testgrid_balancer::{BalancerConfig, LoadBalancer, Strategy};
use testgrid_core::{Capabilities, TaskResult, TaskSpec, Worker, WorkerStatus};
use testgrid_registry::{LoadUpdate, RegistryConfig, WorkerRegistry};
use testgrid_scheduler::{SchedulerConfig, TaskScheduler};

const WORKERS: [&str; 3] = ["w1", "w2", "w3"];
const TASKS: usize = 60;
const BASELINE_LOAD: f64 = 0.2;

/// Usage reports, selections and task bookkeeping race on a real thread
/// pool. None of them may overwrite another's changes to a worker.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_usage_reports_do_not_lose_task_bookkeeping() {
    let registry = WorkerRegistry::new(RegistryConfig::default());
    for id in WORKERS {
        registry
            .register(Worker::new(id, format!("{id}.local:9000"), Capabilities::new()))
            .await;
        registry.update_load(id, &LoadUpdate::load(BASELINE_LOAD)).await;
    }
    let balancer = Arc::new(LoadBalancer::new(
        registry.clone(),
        BalancerConfig {
            strategy: Strategy::WeightedRoundRobin.to_string(),
            rng_seed: Some(11),
            ..BalancerConfig::default()
        },
    ));
    let scheduler = Arc::new(TaskScheduler::new(Arc::clone(&balancer), SchedulerConfig::default()));
    for i in 0..TASKS {
        scheduler.submit(TaskSpec::new(format!("t{i}"), "unit")).await.unwrap();
    }

    let stop = Arc::new(AtomicBool::new(false));

    let updater = {
        let balancer = Arc::clone(&balancer);
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            let mut tick = 0u32;
            while !stop.load(Ordering::Relaxed) {
                for id in WORKERS {
                    let sample = f64::from(tick % 100) / 100.0;
                    let update = LoadUpdate {
                        cpu: Some(sample),
                        memory: Some(1.0 - sample),
                        network_latency: Some(sample * 50.0),
                        ..LoadUpdate::default()
                    };
                    balancer.update_load(id, &update).await;
                }
                tick += 1;
                tokio::task::yield_now().await;
            }
        })
    };

    let selector = {
        let balancer = Arc::clone(&balancer);
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            let any = Capabilities::new();
            while !stop.load(Ordering::Relaxed) {
                balancer.select(&any).await;
                tokio::task::yield_now().await;
            }
        })
    };

    let completed_ok = Arc::new(AtomicUsize::new(0));
    let dispatcher = {
        let scheduler = Arc::clone(&scheduler);
        let completed_ok = Arc::clone(&completed_ok);
        tokio::spawn(async move {
            let mut reports = Vec::new();
            while !scheduler.is_drained().await {
                for a in scheduler.dispatch().await {
                    let scheduler = Arc::clone(&scheduler);
                    let completed_ok = Arc::clone(&completed_ok);
                    reports.push(tokio::spawn(async move {
                        let result = TaskResult::passed(&a.task_id, &a.worker_id, 0.5).with_attempt(a.attempt);
                        if scheduler.complete(result).await.is_ok() {
                            completed_ok.fetch_add(1, Ordering::Relaxed);
                        }
                    }));
                }
                tokio::task::yield_now().await;
            }
            for report in reports {
                report.await.unwrap();
            }
        })
    };

    tokio::time::timeout(Duration::from_secs(30), dispatcher)
        .await
        .expect("dispatcher finished in time")
        .unwrap();
    stop.store(true, Ordering::Relaxed);
    updater.await.unwrap();
    selector.await.unwrap();

    assert_eq!(scheduler.completed_count().await, TASKS);
    assert_eq!(completed_ok.load(Ordering::Relaxed), TASKS);
    for id in WORKERS {
        let w = registry.get(id).await.unwrap();
        assert_eq!(w.active_connections, 0, "{id} leaked a connection");
        assert!(
            (w.current_load - BASELINE_LOAD).abs() < 1e-9,
            "{id} load drifted to {}",
            w.current_load
        );
        assert_eq!(w.status, WorkerStatus::Idle);
    }
}
