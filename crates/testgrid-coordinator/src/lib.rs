//! testgrid-coordinator — one process that owns the whole grid.
//!
//! ```text
//!            submit / report                  register / heartbeat
//!                  │                                   │
//!                  ▼                                   ▼
//!  ┌──────────────────────────────┐      ┌──────────────────────────┐
//!  │ TaskScheduler                │─────►│ LoadBalancer             │
//!  │ queue, deps, retries         │select│ weights, strategy, stats │
//!  └──────────────┬───────────────┘      └────────────┬─────────────┘
//!                 │ Assignment                        │ snapshots
//!                 ▼                                   ▼
//!        TaskExecutor (spawned)            ┌──────────────────────────┐
//!                 │ TaskResult             │ WorkerRegistry           │
//!                 └──► report ──►          │ liveness sweep           │
//!                      ResultAggregator    └────────────┬─────────────┘
//!                                                       │ worker lost
//!                       AutoScaler ──► FleetProvider    └──► requeue
//! ```
//!
//! Background loops: registry sweep, balancer metrics refresh, autoscale
//! monitor and the dispatch loop. The dispatch loop wakes on submissions,
//! completions and registrations, and at least every `dispatch_interval`.

pub mod config;
pub mod coordinator;
pub mod executor;
pub mod sim;

pub use config::GridConfig;
pub use coordinator::{Coordinator, GridSnapshot, ReportOutcome};
pub use executor::TaskExecutor;
