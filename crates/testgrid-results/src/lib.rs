//! testgrid-results — aggregates completion reports into statistics.
//!
//! Every task attempt that ends produces one immutable `TaskResult`. The
//! aggregator keeps them all, grouped by task id, and derives summaries on
//! demand. Queries over unknown ids or an empty store return zeroed
//! structures.

pub mod aggregator;
pub mod summary;

pub use aggregator::ResultAggregator;
pub use summary::{FailedTask, OverallSummary, SlowTask, TaskSummary, WorkerPerformance};
