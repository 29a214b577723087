//! Scheduler error types.

use testgrid_core::{TaskId, TaskStatus, WorkerId};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("task already submitted: {0}")]
    DuplicateTask(TaskId),

    #[error("task {task_id} is {status:?}, expected {expected}")]
    InvalidState {
        task_id: TaskId,
        status: TaskStatus,
        expected: &'static str,
    },

    /// A worker reported on an attempt that is no longer current, e.g.
    /// after the task timed out and was requeued.
    #[error(
        "stale report for task {task_id} attempt {attempt} from {reporter} \
         (held by {holder:?} on attempt {current_attempt})"
    )]
    StaleReport {
        task_id: TaskId,
        reporter: WorkerId,
        attempt: u32,
        holder: Option<WorkerId>,
        current_attempt: u32,
    },
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
