//! Task scheduler — owns every submitted task from submission to a
//! terminal state.
//!
//! Task state sits behind one mutex. `dispatch` holds it while asking the
//! balancer for workers, so assignment and completion for the same task
//! never interleave.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use testgrid_balancer::LoadBalancer;
use testgrid_core::stats::mean;
use testgrid_core::time::epoch_millis;
use testgrid_core::{Task, TaskId, TaskResult, TaskSpec, TaskStatus, WorkerId};
use testgrid_registry::{LoadUpdate, WorkerRegistry};

use crate::config::SchedulerConfig;
use crate::error::{SchedulerError, SchedulerResult};

/// A task bound to a worker by `dispatch`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Assignment {
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    pub endpoint: String,
    pub spec: TaskSpec,
    /// 0 for the first attempt.
    pub attempt: u32,
    /// Time spent queued before this assignment.
    pub queued_for: Duration,
}

/// What happened to a task after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum FailureOutcome {
    /// Requeued; `attempt` is the new retry count.
    Retrying { attempt: u32 },
    /// Retries exhausted.
    Failed { error: String },
}

/// A task failed by `reap_timed_out`.
#[derive(Debug, Clone, PartialEq)]
pub struct TimedOut {
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    pub elapsed: Duration,
    pub outcome: FailureOutcome,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerCounts {
    pub pending: usize,
    /// Assigned or executing.
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Queue key: lower priority first, then submission order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct QueueEntry {
    priority: i64,
    sequence: u64,
    task_id: TaskId,
}

#[derive(Default)]
struct State {
    tasks: HashMap<TaskId, Task>,
    queue: BinaryHeap<Reverse<QueueEntry>>,
    /// Grows monotonically; dependency checks read it.
    completed: HashSet<TaskId>,
    failed: HashSet<TaskId>,
    enqueued_at: HashMap<TaskId, Instant>,
    next_sequence: u64,
    durations: VecDeque<f64>,
}

impl State {
    fn enqueue(&mut self, task_id: &str) {
        if let Some(task) = self.tasks.get(task_id) {
            self.queue.push(Reverse(QueueEntry {
                priority: task.spec.priority,
                sequence: task.sequence,
                task_id: task_id.to_string(),
            }));
            self.enqueued_at.insert(task_id.to_string(), Instant::now());
        }
    }

    fn mark_failed(&mut self, task_id: &str, error: String) {
        if let Some(task) = self.tasks.get_mut(task_id) {
            task.status = TaskStatus::Failed;
            task.ended_at = Some(epoch_millis());
            task.last_error = Some(error.clone());
            error!(%task_id, retries = task.retry_count, %error, "task failed permanently");
        }
        self.failed.insert(task_id.to_string());
        self.enqueued_at.remove(task_id);
    }

    /// Unbind the task from its worker and either requeue it or fail it for
    /// good. Returns the outcome and the worker that held it.
    fn fail_attempt(&mut self, task_id: &str, reason: String) -> Option<(FailureOutcome, Option<WorkerId>)> {
        let task = self.tasks.get_mut(task_id)?;
        let worker = task.assigned_worker.take();
        task.assigned_at = None;
        task.last_error = Some(reason.clone());

        if task.can_retry() {
            task.retry_count += 1;
            task.status = TaskStatus::Pending;
            let attempt = task.retry_count;
            warn!(%task_id, attempt, max_retries = task.max_retries, %reason, "task attempt failed, retrying");
            self.enqueue(task_id);
            Some((FailureOutcome::Retrying { attempt }, worker))
        } else {
            self.mark_failed(task_id, reason.clone());
            Some((FailureOutcome::Failed { error: reason }, worker))
        }
    }
}

pub struct TaskScheduler {
    balancer: Arc<LoadBalancer>,
    config: SchedulerConfig,
    state: Mutex<State>,
}

impl TaskScheduler {
    pub fn new(balancer: Arc<LoadBalancer>, config: SchedulerConfig) -> Self {
        Self {
            balancer,
            config,
            state: Mutex::new(State::default()),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn registry(&self) -> &WorkerRegistry {
        self.balancer.registry()
    }

    /// Queue a task. Ids must be unique for the scheduler's lifetime.
    pub async fn submit(&self, spec: TaskSpec) -> SchedulerResult<()> {
        let mut state = self.state.lock().await;
        if state.tasks.contains_key(&spec.id) {
            return Err(SchedulerError::DuplicateTask(spec.id));
        }

        let sequence = state.next_sequence;
        state.next_sequence += 1;
        let task_id = spec.id.clone();
        debug!(%task_id, priority = spec.priority, deps = spec.dependencies.len(), "task submitted");
        state
            .tasks
            .insert(task_id.clone(), Task::new(spec, sequence, self.config.default_max_retries));
        state.enqueue(&task_id);
        Ok(())
    }

    /// One pass over the tasks queued at entry, assigning every ready task
    /// an eligible worker. Tasks that cannot be placed stay queued.
    pub async fn dispatch(&self) -> Vec<Assignment> {
        let mut state = self.state.lock().await;
        let load_increment = self.config.load_increment;
        let mut deferred = Vec::new();
        let mut assignments = Vec::new();

        for _ in 0..state.queue.len() {
            let Some(Reverse(entry)) = state.queue.pop() else {
                break;
            };
            // Entries for tasks that moved on (e.g. failed by a dependency) are dropped.
            let Some(task) = state.tasks.get(&entry.task_id) else {
                continue;
            };
            if task.status != TaskStatus::Pending {
                continue;
            }
            let dependencies = task.spec.dependencies.clone();
            let requirements = task.spec.requirements.clone();

            if let Some(dep) = dependencies.iter().find(|d| state.failed.contains(*d)) {
                let error = format!("dependency {dep} failed");
                state.mark_failed(&entry.task_id, error);
                continue;
            }
            if !dependencies.iter().all(|d| state.completed.contains(d)) {
                deferred.push(entry);
                continue;
            }

            let Some(worker) = self.balancer.select(&requirements).await else {
                deferred.push(entry);
                continue;
            };
            // The worker can vanish between selection and binding.
            if !self.registry().begin_task(&worker.id, load_increment).await {
                deferred.push(entry);
                continue;
            }

            let queued_for = state
                .enqueued_at
                .remove(&entry.task_id)
                .map(|at| Instant::now().saturating_duration_since(at))
                .unwrap_or_default();
            let Some(task) = state.tasks.get_mut(&entry.task_id) else {
                continue;
            };
            task.status = TaskStatus::Assigned;
            task.assigned_worker = Some(worker.id.clone());
            task.started_at = Some(epoch_millis());
            task.assigned_at = Some(Instant::now());

            debug!(task_id = %entry.task_id, worker_id = %worker.id, attempt = task.retry_count, "task assigned");
            assignments.push(Assignment {
                task_id: entry.task_id.clone(),
                worker_id: worker.id,
                endpoint: worker.endpoint,
                spec: task.spec.clone(),
                attempt: task.retry_count,
                queued_for,
            });
        }

        state.queue.extend(deferred.into_iter().map(Reverse));
        assignments
    }

    /// Record that the worker started executing attempt `attempt` of an
    /// assigned task.
    pub async fn mark_running(&self, task_id: &str, worker_id: &str, attempt: u32) -> SchedulerResult<()> {
        let mut state = self.state.lock().await;
        let task = Self::held_task(&mut state, task_id, worker_id, attempt)?;
        if task.status != TaskStatus::Assigned {
            return Err(SchedulerError::InvalidState {
                task_id: task_id.to_string(),
                status: task.status,
                expected: "assigned",
            });
        }
        task.status = TaskStatus::Running;
        Ok(())
    }

    /// Finish a task with the result its worker reported. The result must
    /// name the current attempt.
    pub async fn complete(&self, result: TaskResult) -> SchedulerResult<()> {
        let mut state = self.state.lock().await;
        let task_id = result.task_id.clone();
        let worker_id = result.worker_id.clone();
        let duration = result.duration_secs;

        let task = Self::held_task(&mut state, &task_id, &worker_id, result.attempt)?;
        task.status = TaskStatus::Completed;
        task.ended_at = Some(epoch_millis());
        task.assigned_worker = None;
        task.assigned_at = None;
        task.result = Some(result);

        state.completed.insert(task_id.clone());
        state.durations.push_back(duration);
        while state.durations.len() > self.config.duration_window.max(1) {
            state.durations.pop_front();
        }

        let registry = self.registry();
        registry.finish_task(&worker_id, self.config.load_increment).await;
        let sample = LoadUpdate {
            response_time: Some(duration),
            ..LoadUpdate::default()
        };
        registry.update_load(&worker_id, &sample).await;

        info!(%task_id, %worker_id, duration_secs = duration, "task completed");
        Ok(())
    }

    /// Fail attempt `attempt` of a task held by `worker_id`.
    pub async fn fail(
        &self,
        task_id: &str,
        worker_id: &str,
        attempt: u32,
        error: impl Into<String>,
    ) -> SchedulerResult<FailureOutcome> {
        let mut state = self.state.lock().await;
        Self::held_task(&mut state, task_id, worker_id, attempt)?;
        let Some((outcome, worker)) = state.fail_attempt(task_id, error.into()) else {
            return Err(SchedulerError::TaskNotFound(task_id.to_string()));
        };
        if let Some(worker) = worker {
            self.registry()
                .finish_task(&worker, self.config.load_increment)
                .await;
        }
        Ok(outcome)
    }

    /// Fail every in-flight task bound to a worker that has left the
    /// registry. The worker record is gone, so no load is released.
    pub async fn handle_worker_lost(&self, worker_id: &str) -> Vec<(TaskId, FailureOutcome)> {
        let mut state = self.state.lock().await;
        let held: Vec<TaskId> = state
            .tasks
            .values()
            .filter(|t| t.status.is_in_flight() && t.assigned_worker.as_deref() == Some(worker_id))
            .map(|t| t.spec.id.clone())
            .collect();

        let mut outcomes = Vec::new();
        for task_id in held {
            let reason = format!("worker {worker_id} lost");
            if let Some((outcome, _)) = state.fail_attempt(&task_id, reason) {
                outcomes.push((task_id, outcome));
            }
        }
        if !outcomes.is_empty() {
            warn!(%worker_id, tasks = outcomes.len(), "requeued tasks of lost worker");
        }
        outcomes
    }

    /// Fail every in-flight task assigned for longer than its timeout.
    pub async fn reap_timed_out(&self) -> Vec<TimedOut> {
        let mut state = self.state.lock().await;
        let default_timeout = self.config.task_timeout;
        let expired: Vec<(TaskId, Duration)> = state
            .tasks
            .values()
            .filter(|t| t.status.is_in_flight())
            .filter_map(|t| {
                let elapsed = t.elapsed()?;
                let limit = t.spec.timeout().unwrap_or(default_timeout);
                (elapsed >= limit).then(|| (t.spec.id.clone(), elapsed))
            })
            .collect();

        let mut timed_out = Vec::new();
        for (task_id, elapsed) in expired {
            let reason = format!("timed out after {:.1}s", elapsed.as_secs_f64());
            let Some((outcome, Some(worker_id))) = state.fail_attempt(&task_id, reason) else {
                continue;
            };
            self.registry()
                .finish_task(&worker_id, self.config.load_increment)
                .await;
            timed_out.push(TimedOut {
                task_id,
                worker_id,
                elapsed,
                outcome,
            });
        }
        timed_out
    }

    pub async fn task(&self, task_id: &str) -> Option<Task> {
        self.state.lock().await.tasks.get(task_id).cloned()
    }

    pub async fn counts(&self) -> SchedulerCounts {
        let state = self.state.lock().await;
        let mut counts = SchedulerCounts::default();
        for task in state.tasks.values() {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Assigned | TaskStatus::Running => counts.running += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub async fn pending_count(&self) -> usize {
        self.counts().await.pending
    }

    pub async fn running_count(&self) -> usize {
        self.counts().await.running
    }

    pub async fn completed_count(&self) -> usize {
        self.state.lock().await.completed.len()
    }

    /// Rolling mean duration of recently completed tasks, in seconds.
    pub async fn mean_task_duration(&self) -> f64 {
        let state = self.state.lock().await;
        let durations: Vec<f64> = state.durations.iter().copied().collect();
        mean(&durations)
    }

    /// True once every submitted task is completed or failed.
    pub async fn is_drained(&self) -> bool {
        let state = self.state.lock().await;
        state.tasks.values().all(|t| t.status.is_terminal())
    }

    /// The in-flight task `task_id`, provided `worker_id` holds it and
    /// `attempt` is the attempt in progress. A worker that timed out and got
    /// the task again still holds it, so the attempt tells the two apart.
    fn held_task<'a>(
        state: &'a mut State,
        task_id: &str,
        worker_id: &str,
        attempt: u32,
    ) -> SchedulerResult<&'a mut Task> {
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| SchedulerError::TaskNotFound(task_id.to_string()))?;
        if !task.status.is_in_flight() {
            return Err(SchedulerError::InvalidState {
                task_id: task_id.to_string(),
                status: task.status,
                expected: "assigned or running",
            });
        }
        if task.assigned_worker.as_deref() != Some(worker_id) || task.retry_count != attempt {
            warn!(
                %task_id,
                reporter = %worker_id,
                attempt,
                holder = ?task.assigned_worker,
                current_attempt = task.retry_count,
                "stale report rejected"
            );
            return Err(SchedulerError::StaleReport {
                task_id: task_id.to_string(),
                reporter: worker_id.to_string(),
                attempt,
                holder: task.assigned_worker.clone(),
                current_attempt: task.retry_count,
            });
        }
        Ok(task)
    }
}
