//! Worker registry — tracks known workers, their status and load.
//!
//! The worker map sits behind a single `RwLock`; every mutation happens
//! inside one write-lock critical section so concurrent load updates and
//! assignments cannot interleave into a lost update.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use testgrid_core::lifecycle::{BackgroundTask, run_periodic};
use testgrid_core::{Worker, WorkerId, WorkerStatus};

use crate::config::RegistryConfig;

/// Callback invoked with each worker removed from the registry, whether by
/// explicit unregistration or by the liveness sweep.
///
/// The scheduler uses this to requeue tasks the worker was holding.
pub type WorkerLostCallback = Arc<dyn Fn(Worker) -> BoxFuture + Send + Sync>;

/// Boxed future returned by [`WorkerLostCallback`].
pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Partial update of a worker's load and usage samples.
///
/// Fields left as `None` keep their current value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadUpdate {
    pub current_load: Option<f64>,
    pub cpu: Option<f64>,
    pub memory: Option<f64>,
    pub network_latency: Option<f64>,
    pub active_connections: Option<u32>,
    /// One response-time sample (seconds) to append to the history.
    pub response_time: Option<f64>,
}

impl LoadUpdate {
    pub fn load(current_load: f64) -> Self {
        Self {
            current_load: Some(current_load),
            ..Self::default()
        }
    }
}

/// Shared handle to the worker set. Cloning is cheap.
#[derive(Clone)]
pub struct WorkerRegistry {
    /// Known workers, ordered by id so iteration is deterministic.
    workers: Arc<RwLock<BTreeMap<WorkerId, Worker>>>,
    config: Arc<RegistryConfig>,
    on_worker_lost: Arc<std::sync::RwLock<Option<WorkerLostCallback>>>,
    sweep: Arc<BackgroundTask>,
}

impl WorkerRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            workers: Arc::new(RwLock::new(BTreeMap::new())),
            config: Arc::new(config),
            on_worker_lost: Arc::new(std::sync::RwLock::new(None)),
            sweep: Arc::new(BackgroundTask::new("registry-sweep")),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Set the callback fired for every removed worker.
    pub fn on_worker_lost(&self, callback: WorkerLostCallback) {
        if let Ok(mut slot) = self.on_worker_lost.write() {
            *slot = Some(callback);
        }
    }

    /// Add a worker, or replace an existing record with the same id.
    ///
    /// Registration counts as a heartbeat.
    pub async fn register(&self, mut worker: Worker) {
        worker.last_heartbeat = Instant::now();
        let worker_id = worker.id.clone();
        let endpoint = worker.endpoint.clone();

        let mut workers = self.workers.write().await;
        if workers.insert(worker_id.clone(), worker).is_some() {
            warn!(%worker_id, %endpoint, "worker re-registered, previous record replaced");
        } else {
            info!(%worker_id, %endpoint, "worker registered");
        }
    }

    /// Remove a worker. Returns the removed record, or `None` if unknown.
    pub async fn unregister(&self, worker_id: &str) -> Option<Worker> {
        let removed = self.workers.write().await.remove(worker_id);
        match removed {
            Some(worker) => {
                info!(%worker_id, "worker unregistered");
                self.notify_lost(vec![worker.clone()]).await;
                Some(worker)
            }
            None => {
                warn!(%worker_id, "unregister for unknown worker ignored");
                None
            }
        }
    }

    /// Refresh a worker's heartbeat. Returns `false` for unknown workers.
    pub async fn heartbeat(&self, worker_id: &str) -> bool {
        self.update(worker_id, "heartbeat", |w| {
            w.last_heartbeat = Instant::now();
        })
        .await
    }

    /// Set a worker's status. Returns `false` for unknown workers.
    pub async fn set_status(&self, worker_id: &str, status: WorkerStatus) -> bool {
        let updated = self
            .update(worker_id, "set_status", |w| w.status = status)
            .await;
        if updated {
            debug!(%worker_id, ?status, "worker status updated");
        }
        updated
    }

    /// Apply a partial load/usage update.
    pub async fn update_load(&self, worker_id: &str, update: &LoadUpdate) -> bool {
        let window = self.config.response_time_window;
        self.update(worker_id, "update_load", |w| {
            if let Some(load) = update.current_load {
                w.current_load = load.clamp(0.0, 1.0);
            }
            if let Some(cpu) = update.cpu {
                w.usage.cpu = cpu;
            }
            if let Some(memory) = update.memory {
                w.usage.memory = memory;
            }
            if let Some(latency) = update.network_latency {
                w.usage.network_latency = latency;
            }
            if let Some(connections) = update.active_connections {
                w.active_connections = connections;
            }
            if let Some(rt) = update.response_time {
                w.record_response_time(rt, window);
            }
        })
        .await
    }

    /// Bind one more task to a worker: bump its connection count and load
    /// and mark it busy.
    pub async fn begin_task(&self, worker_id: &str, load_increment: f64) -> bool {
        self.update(worker_id, "begin_task", |w| {
            w.active_connections += 1;
            w.current_load = (w.current_load + load_increment).min(1.0);
            w.status = WorkerStatus::Busy;
        })
        .await
    }

    /// Release one task from a worker. The worker returns to idle once it
    /// holds no tasks; an offline worker stays offline.
    pub async fn finish_task(&self, worker_id: &str, load_increment: f64) -> bool {
        self.update(worker_id, "finish_task", |w| {
            w.active_connections = w.active_connections.saturating_sub(1);
            w.current_load = (w.current_load - load_increment).max(0.0);
            if w.active_connections == 0 && w.status == WorkerStatus::Busy {
                w.status = WorkerStatus::Idle;
            }
        })
        .await
    }

    /// Workers that can take a new task right now.
    pub async fn available(&self) -> Vec<Worker> {
        let timeout = self.config.heartbeat_timeout;
        let workers = self.workers.read().await;
        workers
            .values()
            .filter(|w| w.is_available(timeout))
            .cloned()
            .collect()
    }

    pub async fn get(&self, worker_id: &str) -> Option<Worker> {
        self.workers.read().await.get(worker_id).cloned()
    }

    /// Snapshot of every known worker, ordered by id.
    pub async fn list(&self) -> Vec<Worker> {
        self.workers.read().await.values().cloned().collect()
    }

    pub async fn worker_count(&self) -> usize {
        self.workers.read().await.len()
    }

    /// Workers whose status is not offline.
    pub async fn active_worker_count(&self) -> usize {
        let workers = self.workers.read().await;
        workers
            .values()
            .filter(|w| w.status != WorkerStatus::Offline)
            .count()
    }

    /// Remove workers whose heartbeat is older than twice the heartbeat
    /// interval. Returns the removed records.
    pub async fn reap_dead(&self) -> Vec<Worker> {
        let dead_after = self.config.dead_after();
        let reaped: Vec<Worker> = {
            let mut workers = self.workers.write().await;
            let dead: Vec<WorkerId> = workers
                .values()
                .filter(|w| w.heartbeat_age() > dead_after)
                .map(|w| w.id.clone())
                .collect();
            dead.iter().filter_map(|id| workers.remove(id)).collect()
        };

        for worker in &reaped {
            warn!(
                worker_id = %worker.id,
                age_ms = worker.heartbeat_age().as_millis() as u64,
                in_flight = worker.active_connections,
                "removed unresponsive worker"
            );
        }
        if !reaped.is_empty() {
            self.notify_lost(reaped.clone()).await;
        }
        reaped
    }

    /// Start the periodic dead-worker sweep. No-op if already running.
    pub async fn start_sweep(&self) -> bool {
        let registry = self.clone();
        let interval = self.config.sweep_interval;
        self.sweep
            .start(move |shutdown| async move {
                run_periodic("registry-sweep", interval, shutdown, || {
                    let registry = registry.clone();
                    async move {
                        registry.reap_dead().await;
                    }
                })
                .await;
            })
            .await
    }

    pub async fn stop_sweep(&self) -> bool {
        self.sweep.stop().await
    }

    pub async fn is_sweeping(&self) -> bool {
        self.sweep.is_running().await
    }

    // ── Internal helpers ────────────────────────────────────────────

    /// Mutate one worker under the write lock. Unknown ids are a logged no-op.
    async fn update<F>(&self, worker_id: &str, op: &'static str, f: F) -> bool
    where
        F: FnOnce(&mut Worker),
    {
        let mut workers = self.workers.write().await;
        match workers.get_mut(worker_id) {
            Some(worker) => {
                f(worker);
                true
            }
            None => {
                warn!(%worker_id, op, "update for unknown worker ignored");
                false
            }
        }
    }

    /// Invoke the lost-worker callback outside the worker lock.
    async fn notify_lost(&self, workers: Vec<Worker>) {
        let callback = self
            .on_worker_lost
            .read()
            .ok()
            .and_then(|slot| slot.clone());
        if let Some(cb) = callback {
            for worker in workers {
                cb(worker).await;
            }
        }
    }
}
