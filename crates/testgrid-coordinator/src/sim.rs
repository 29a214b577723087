//! Simulated executor and fleet for dry runs.
//!
//! Everything here is seeded, so a simulation with a fixed seed draws the
//! same durations and failures every time. Wall-clock interleaving still
//! decides which worker gets which task.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use testgrid_autoscale::{FleetProvider, FleetStatus};
use testgrid_core::{Capabilities, TaskResult, TaskSpec, Worker, WorkerId, WorkerStatus};
use testgrid_registry::WorkerRegistry;
use testgrid_scheduler::Assignment;

use crate::executor::TaskExecutor;

const CATEGORIES: [&str; 4] = ["unit", "integration", "api", "ui"];

/// Sleeps for a random duration, then passes or fails at a fixed rate.
pub struct SimulatedExecutor {
    rng: Mutex<StdRng>,
    mean_duration: Duration,
    failure_rate: f64,
}

impl SimulatedExecutor {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            mean_duration: Duration::from_millis(100),
            failure_rate: 0.0,
        }
    }

    /// Durations are drawn uniformly from 0.5× to 1.5× of `mean`.
    pub fn with_mean_duration(mut self, mean: Duration) -> Self {
        self.mean_duration = mean;
        self
    }

    /// Clamped to `0.0..=1.0`. A non-finite rate means no failures.
    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = if rate.is_finite() { rate.clamp(0.0, 1.0) } else { 0.0 };
        self
    }

    fn draw(&self) -> (Duration, bool) {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let factor = rng.gen_range(0.5..1.5);
        let fails = rng.gen_bool(self.failure_rate);
        (self.mean_duration.mul_f64(factor), fails)
    }
}

#[async_trait]
impl TaskExecutor for SimulatedExecutor {
    async fn execute(&self, assignment: &Assignment) -> TaskResult {
        let (duration, fails) = self.draw();
        tokio::time::sleep(duration).await;

        let secs = duration.as_secs_f64();
        let result = if fails {
            TaskResult::failed(&assignment.task_id, &assignment.worker_id, secs, "simulated failure")
        } else {
            TaskResult::passed(&assignment.task_id, &assignment.worker_id, secs)
        };
        result.with_metric("attempt", f64::from(assignment.attempt))
    }
}

/// Fleet provider that registers `sim-N` workers directly in the registry.
///
/// The fleet is every worker the registry knows, including ones registered
/// before the provider existed. Shrinking removes workers this provider
/// started first, newest first, then the remaining workers, idle ones first.
pub struct SimulatedFleet {
    registry: WorkerRegistry,
    capabilities: Capabilities,
    members: tokio::sync::Mutex<Fleet>,
}

#[derive(Default)]
struct Fleet {
    next: usize,
    /// Workers started here, oldest first.
    started: Vec<WorkerId>,
}

impl SimulatedFleet {
    /// Workers started by this fleet advertise `capabilities`.
    pub fn new(registry: WorkerRegistry, capabilities: Capabilities) -> Self {
        Self {
            registry,
            capabilities,
            members: tokio::sync::Mutex::new(Fleet::default()),
        }
    }

    /// Forget started workers the registry no longer knows, e.g. after a
    /// sweep.
    async fn prune(&self, fleet: &mut Fleet) {
        let mut live = Vec::with_capacity(fleet.started.len());
        for id in fleet.started.drain(..) {
            if self.registry.get(&id).await.is_some() {
                live.push(id);
            }
        }
        fleet.started = live;
    }

    async fn grow(&self, fleet: &mut Fleet, by: usize) {
        let mut added = 0;
        while added < by {
            let id = format!("sim-{}", fleet.next);
            fleet.next += 1;
            if self.registry.get(&id).await.is_some() {
                continue;
            }
            let endpoint = format!("sim://{id}");
            self.registry
                .register(Worker::new(id.clone(), endpoint, self.capabilities.clone()))
                .await;
            fleet.started.push(id);
            added += 1;
        }
    }

    async fn shrink(&self, fleet: &mut Fleet, by: usize) {
        let mut victims: Vec<WorkerId> = fleet.started.iter().rev().take(by).cloned().collect();
        if victims.len() < by {
            let mut others: Vec<Worker> = self
                .registry
                .list()
                .await
                .into_iter()
                .filter(|w| !fleet.started.contains(&w.id))
                .collect();
            // Idle before busy, then highest id first.
            others.sort_by(|a, b| {
                (a.status != WorkerStatus::Idle)
                    .cmp(&(b.status != WorkerStatus::Idle))
                    .then_with(|| b.id.cmp(&a.id))
            });
            victims.extend(others.into_iter().take(by - victims.len()).map(|w| w.id));
        }

        for id in victims {
            fleet.started.retain(|s| *s != id);
            self.registry.unregister(&id).await;
        }
    }
}

#[async_trait]
impl FleetProvider for SimulatedFleet {
    async fn scale_to(&self, target: usize) -> anyhow::Result<()> {
        let mut fleet = self.members.lock().await;
        self.prune(&mut fleet).await;

        let current = self.registry.worker_count().await;
        if current < target {
            self.grow(&mut fleet, target - current).await;
        } else if current > target {
            self.shrink(&mut fleet, current - target).await;
        }

        info!(from = current, target, "simulated fleet resized");
        Ok(())
    }

    async fn status(&self) -> anyhow::Result<FleetStatus> {
        let workers = self.registry.list().await;
        let healthy = workers
            .iter()
            .filter(|w| w.status != WorkerStatus::Offline)
            .count();
        Ok(FleetStatus {
            current: workers.len(),
            healthy,
        })
    }
}

/// Heartbeat every registered worker each `interval`, standing in for
/// real workers checking in. Abort the handle to stop.
pub fn spawn_heartbeats(registry: WorkerRegistry, interval: Duration) -> JoinHandle<()> {
    let interval = interval.max(Duration::from_millis(10));
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            for worker in registry.list().await {
                registry.heartbeat(&worker.id).await;
            }
        }
    })
}

fn caps(pairs: &[(&str, &str)]) -> Capabilities {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// `n` workers named `worker-0..n`.
///
/// `worker-0` carries every default capability bonus; the rest are
/// linux/8GB/4-core or macos/8GB/4-core, alternating.
pub fn sim_workers(n: usize) -> Vec<Worker> {
    (0..n)
        .map(|i| {
            let capabilities = match i {
                0 => caps(&[("os", "linux"), ("memory", "16GB"), ("cpu_cores", "8")]),
                i if i % 2 == 1 => caps(&[("os", "linux"), ("memory", "8GB"), ("cpu_cores", "4")]),
                _ => caps(&[("os", "macos"), ("memory", "8GB"), ("cpu_cores", "4")]),
            };
            Worker::new(format!("worker-{i}"), format!("sim://worker-{i}"), capabilities)
        })
        .collect()
}

/// Capabilities for workers started by the simulated fleet.
pub fn fleet_capabilities() -> Capabilities {
    caps(&[("os", "linux"), ("memory", "8GB"), ("cpu_cores", "4")])
}

/// A random test plan of `count` tasks.
///
/// Priorities are 0..=3. About one task in ten depends on an earlier task,
/// and about one in five requires `os = linux`, so plans never contain
/// cycles and every task can run on a linux worker.
pub fn generate_plan(count: usize, seed: u64) -> Vec<TaskSpec> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut plan = Vec::with_capacity(count);
    for i in 0..count {
        let category = CATEGORIES[rng.gen_range(0..CATEGORIES.len())];
        let mut spec = TaskSpec::new(format!("{category}-{i:04}"), category)
            .with_priority(rng.gen_range(0..=3));
        if i > 0 && rng.gen_bool(0.1) {
            let dependency: &TaskSpec = &plan[rng.gen_range(0..i)];
            spec = spec.depends_on(dependency.id.clone());
        }
        if rng.gen_bool(0.2) {
            spec = spec.requires("os", "linux");
        }
        plan.push(spec);
    }
    debug!(count, seed, "generated task plan");
    plan
}
