//! Domain types shared across the TestGrid crates.
//!
//! Workers are owned by the registry, tasks by the scheduler. Results are
//! immutable records handed to the aggregator once a task attempt ends.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::time::epoch_millis;

/// Unique identifier for a worker node.
pub type WorkerId = String;

/// Unique identifier for a task.
pub type TaskId = String;

/// Capability map advertised by a worker (e.g. `os = "linux"`).
pub type Capabilities = HashMap<String, String>;

/// Returns true when every requested key/value pair equals the worker's
/// corresponding capability. Empty requirements match everything.
pub fn matches_requirements(capabilities: &Capabilities, requirements: &Capabilities) -> bool {
    requirements
        .iter()
        .all(|(key, value)| capabilities.get(key).is_some_and(|v| v == value))
}

// ── Worker ─────────────────────────────────────────────────────────

/// Availability of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    #[default]
    Idle,
    Busy,
    Offline,
}

/// Resource usage samples reported for a worker (fractions in 0.0..=1.0,
/// latency in seconds).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu: f64,
    pub memory: f64,
    pub network_latency: f64,
}

/// A worker node known to the registry.
#[derive(Debug, Clone, Serialize)]
pub struct Worker {
    pub id: WorkerId,
    /// Address the execution boundary uses to reach the worker.
    pub endpoint: String,
    pub capabilities: Capabilities,
    pub status: WorkerStatus,
    /// Last heartbeat (monotonic).
    #[serde(skip)]
    pub last_heartbeat: Instant,
    /// Current load in 0.0..=1.0.
    pub current_load: f64,
    /// Load at or above which the worker takes no new tasks.
    pub max_load: f64,
    pub usage: ResourceUsage,
    /// Tasks currently bound to this worker.
    pub active_connections: u32,
    /// Most recent response times in seconds, oldest first.
    pub response_times: VecDeque<f64>,
}

impl Worker {
    pub fn new(id: impl Into<String>, endpoint: impl Into<String>, capabilities: Capabilities) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            capabilities,
            status: WorkerStatus::Idle,
            last_heartbeat: Instant::now(),
            current_load: 0.0,
            max_load: 1.0,
            usage: ResourceUsage::default(),
            active_connections: 0,
            response_times: VecDeque::new(),
        }
    }

    pub fn with_max_load(mut self, max_load: f64) -> Self {
        self.max_load = max_load;
        self
    }

    /// Time since the last heartbeat.
    pub fn heartbeat_age(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_heartbeat)
    }

    /// Idle, below its load ceiling, and heard from within `timeout`.
    pub fn is_available(&self, timeout: Duration) -> bool {
        self.status == WorkerStatus::Idle
            && self.current_load < self.max_load
            && self.heartbeat_age() < timeout
    }

    /// Append a response-time sample, keeping at most `window` samples.
    pub fn record_response_time(&mut self, seconds: f64, window: usize) {
        self.response_times.push_back(seconds);
        while self.response_times.len() > window.max(1) {
            self.response_times.pop_front();
        }
    }

    /// Mean of the retained response-time samples, if any.
    pub fn mean_response_time(&self) -> Option<f64> {
        if self.response_times.is_empty() {
            return None;
        }
        Some(self.response_times.iter().sum::<f64>() / self.response_times.len() as f64)
    }

    /// Average of CPU and memory usage.
    pub fn resource_utilization(&self) -> f64 {
        (self.usage.cpu + self.usage.memory) / 2.0
    }
}

// ── Task ───────────────────────────────────────────────────────────

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Bound to a worker (assigned or executing).
    pub fn is_in_flight(self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::Running)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// What a caller submits: the immutable description of a unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: TaskId,
    /// Free-form category, e.g. `"ui"` or `"api"`.
    pub category: String,
    /// Lower values dispatch first.
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    /// Capability requirements matched exactly against workers.
    #[serde(default)]
    pub requirements: Capabilities,
    /// Overrides the scheduler's default retry budget.
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Overrides the scheduler's default task timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl TaskSpec {
    pub fn new(id: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            category: category.into(),
            priority: 0,
            dependencies: Vec::new(),
            requirements: Capabilities::new(),
            max_retries: None,
            timeout_ms: None,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    pub fn requires(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.requirements.insert(key.into(), value.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// The scheduler's record of a submitted task.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub spec: TaskSpec,
    pub status: TaskStatus,
    pub assigned_worker: Option<WorkerId>,
    /// Submission order, used as the priority tie-break.
    pub sequence: u64,
    /// Epoch milliseconds of the latest assignment.
    pub started_at: Option<u64>,
    /// Epoch milliseconds when the task reached a terminal state.
    pub ended_at: Option<u64>,
    /// Monotonic assignment instant, used for timeouts.
    #[serde(skip)]
    pub assigned_at: Option<Instant>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Result of the successful attempt.
    pub result: Option<TaskResult>,
    /// Most recent failure, preserved when the task fails permanently.
    pub last_error: Option<String>,
}

impl Task {
    pub fn new(spec: TaskSpec, sequence: u64, default_max_retries: u32) -> Self {
        let max_retries = spec.max_retries.unwrap_or(default_max_retries);
        Self {
            spec,
            status: TaskStatus::Pending,
            assigned_worker: None,
            sequence,
            started_at: None,
            ended_at: None,
            assigned_at: None,
            retry_count: 0,
            max_retries,
            result: None,
            last_error: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Wall time since the current assignment.
    pub fn elapsed(&self) -> Option<Duration> {
        self.assigned_at
            .map(|at| Instant::now().saturating_duration_since(at))
    }
}

// ── Results ────────────────────────────────────────────────────────

/// Outcome of one task attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Passed,
    Failed,
    Error,
}

impl ResultStatus {
    pub fn is_success(self) -> bool {
        self == ResultStatus::Passed
    }
}

/// Completion report for one task attempt on one worker.
///
/// Created when an attempt ends and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    /// Which attempt this reports on, 0 for the first.
    #[serde(default)]
    pub attempt: u32,
    pub status: ResultStatus,
    /// Attempt duration in seconds.
    pub duration_secs: f64,
    /// Epoch milliseconds when the report was produced.
    pub timestamp: u64,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub metrics: Option<HashMap<String, f64>>,
}

impl TaskResult {
    fn new(task_id: &str, worker_id: &str, status: ResultStatus, duration_secs: f64) -> Self {
        Self {
            task_id: task_id.to_string(),
            worker_id: worker_id.to_string(),
            attempt: 0,
            status,
            duration_secs,
            timestamp: epoch_millis(),
            error: None,
            metrics: None,
        }
    }

    pub fn passed(task_id: &str, worker_id: &str, duration_secs: f64) -> Self {
        Self::new(task_id, worker_id, ResultStatus::Passed, duration_secs)
    }

    pub fn failed(task_id: &str, worker_id: &str, duration_secs: f64, error: impl Into<String>) -> Self {
        let mut result = Self::new(task_id, worker_id, ResultStatus::Failed, duration_secs);
        result.error = Some(error.into());
        result
    }

    pub fn errored(task_id: &str, worker_id: &str, duration_secs: f64, error: impl Into<String>) -> Self {
        let mut result = Self::new(task_id, worker_id, ResultStatus::Error, duration_secs);
        result.error = Some(error.into());
        result
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics
            .get_or_insert_with(HashMap::new)
            .insert(name.into(), value);
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Error text for a non-passing result, falling back to the status name.
    pub fn error_message(&self) -> String {
        match (&self.error, self.status) {
            (Some(e), _) => e.clone(),
            (None, ResultStatus::Passed) => String::new(),
            (None, ResultStatus::Failed) => "task failed".to_string(),
            (None, ResultStatus::Error) => "task errored".to_string(),
        }
    }
}
