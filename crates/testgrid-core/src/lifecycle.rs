//! Start/stop lifecycle for background loops.
//!
//! Each component that runs a periodic loop (liveness sweep, metrics
//! refresh, scaling monitor, dispatch) owns one `BackgroundTask`. Starting a
//! loop that is already running is a no-op; stopping signals the loop over a
//! `watch` channel and waits for the current iteration to finish.

use std::future::Future;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A running loop: its task handle and shutdown signal.
struct Running {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Owns at most one instance of a named background loop.
pub struct BackgroundTask {
    name: &'static str,
    slot: Mutex<Option<Running>>,
}

impl BackgroundTask {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slot: Mutex::new(None),
        }
    }

    /// Spawn the loop produced by `f` unless one is already running.
    ///
    /// `f` receives the shutdown receiver the loop must watch. Returns
    /// `false` when the loop was already running.
    pub async fn start<F, Fut>(&self, f: F) -> bool
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.slot.lock().await;
        if let Some(running) = slot.as_ref()
            && !running.handle.is_finished()
        {
            debug!(task = self.name, "background loop already running");
            return false;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(f(shutdown_rx));
        *slot = Some(Running {
            handle,
            shutdown_tx,
        });
        info!(task = self.name, "background loop started");
        true
    }

    /// Signal the loop to stop and wait for it to exit.
    ///
    /// Returns `false` when nothing was running.
    pub async fn stop(&self) -> bool {
        let running = self.slot.lock().await.take();
        let Some(running) = running else {
            return false;
        };

        let _ = running.shutdown_tx.send(true);
        if let Err(e) = running.handle.await
            && !e.is_cancelled()
        {
            warn!(task = self.name, error = %e, "background loop panicked");
        }
        info!(task = self.name, "background loop stopped");
        true
    }

    pub async fn is_running(&self) -> bool {
        let slot = self.slot.lock().await;
        slot.as_ref().is_some_and(|r| !r.handle.is_finished())
    }
}

/// Run `tick` every `interval` until `shutdown` fires.
///
/// A tick in progress is allowed to finish; the loop exits before the next.
pub async fn run_periodic<F, Fut>(
    name: &'static str,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    debug!(task = name, interval_ms = interval.as_millis() as u64, "loop running");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => tick().await,
            _ = shutdown.changed() => {
                debug!(task = name, "loop shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting_loop(
        counter: Arc<AtomicU32>,
    ) -> impl FnOnce(watch::Receiver<bool>) -> std::pin::Pin<Box<dyn Future<Output = ()> + Send>> {
        move |shutdown| {
            Box::pin(async move {
                run_periodic("test", Duration::from_millis(10), shutdown, || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                })
                .await;
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn start_runs_the_loop() {
        let task = BackgroundTask::new("test");
        let counter = Arc::new(AtomicU32::new(0));

        assert!(task.start(counting_loop(counter.clone())).await);
        tokio::time::sleep(Duration::from_millis(55)).await;
        assert!(counter.load(Ordering::SeqCst) >= 4);
        assert!(task.stop().await);
    }

    #[tokio::test(start_paused = true)]
    async fn double_start_is_a_noop() {
        let task = BackgroundTask::new("test");
        let counter = Arc::new(AtomicU32::new(0));

        assert!(task.start(counting_loop(counter.clone())).await);
        assert!(!task.start(counting_loop(counter.clone())).await);

        tokio::time::sleep(Duration::from_millis(35)).await;
        // One loop ticking every 10ms, not two.
        assert!(counter.load(Ordering::SeqCst) <= 4);
        task.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_halts_ticks() {
        let task = BackgroundTask::new("test");
        let counter = Arc::new(AtomicU32::new(0));

        task.start(counting_loop(counter.clone())).await;
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(task.stop().await);
        assert!(!task.is_running().await);

        let seen = counter.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn stop_without_start_returns_false() {
        let task = BackgroundTask::new("test");
        assert!(!task.stop().await);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_after_stop() {
        let task = BackgroundTask::new("test");
        let counter = Arc::new(AtomicU32::new(0));

        task.start(counting_loop(counter.clone())).await;
        task.stop().await;
        assert!(task.start(counting_loop(counter)).await);
        assert!(task.is_running().await);
        task.stop().await;
    }
}
