//! testgrid-core — shared types and plumbing for the TestGrid coordinator.
//!
//! Every other TestGrid crate builds on the definitions here:
//!
//! - [`types`]: workers, tasks, task specs, and completion results
//! - [`stats`]: descriptive statistics shared by the balancer and aggregator
//! - [`time`]: epoch timestamps and human-readable duration parsing
//! - [`lifecycle`]: start/stop handle for periodic background loops
//!
//! # Architecture
//!
//! ```text
//! testgrid-core
//!   ├── WorkerRegistry   (testgrid-registry)
//!   ├── LoadBalancer     (testgrid-balancer)   → registry
//!   ├── TaskScheduler    (testgrid-scheduler)  → registry, balancer
//!   ├── AutoScaler       (testgrid-autoscale)  → registry, scheduler
//!   ├── ResultAggregator (testgrid-results)
//!   └── Coordinator      (testgrid-coordinator) wires them together
//! ```

pub mod lifecycle;
pub mod stats;
pub mod time;
pub mod types;

pub use lifecycle::{BackgroundTask, run_periodic};
pub use stats::DescriptiveStats;
pub use types::*;
