//! testgrid-scheduler — decides which task runs next and where.
//!
//! ```text
//!  submit ──► queue (priority, submission order)
//!               │ dispatch(): one pass over the tasks queued at entry
//!               ▼
//!     deps completed? ── no ──► back on the queue
//!               │ yes
//!     balancer.select(requirements) ── none ──► back on the queue
//!               │ worker
//!               ▼
//!          Assigned ──► Running ──► complete ──► Completed
//!               │           │
//!               └── fail / timeout / worker lost
//!                       │
//!          retries left? ── yes ──► Pending (requeued)
//!                       └── no ──► Failed (last error kept)
//! ```

pub mod config;
pub mod error;
pub mod scheduler;

pub use config::SchedulerConfig;
pub use error::{SchedulerError, SchedulerResult};
pub use scheduler::{Assignment, FailureOutcome, SchedulerCounts, TaskScheduler, TimedOut};
