//! testgrid-registry — the set of known workers and their liveness.
//!
//! The registry exclusively owns `Worker` records. Everything else reads
//! workers through snapshot copies returned by its methods.
//!
//! # Liveness
//!
//! ```text
//! heartbeat(id)          → refresh last_heartbeat
//! available()            → idle ∧ load < max_load ∧ age < heartbeat_timeout
//! sweep (every interval) → remove workers with age > 2 × heartbeat_interval
//!                          └── WorkerLostCallback(worker) for each removal
//! ```
//!
//! Operations on unknown worker ids are logged no-ops, since workers may
//! unregister while updates for them are still in flight.

pub mod config;
pub mod registry;

pub use config::RegistryConfig;
pub use registry::{BoxFuture, LoadUpdate, WorkerLostCallback, WorkerRegistry};
