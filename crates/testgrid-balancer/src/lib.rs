//! testgrid-balancer — worker selection for pending tasks.
//!
//! The balancer never owns worker records. It reads snapshots from the
//! `WorkerRegistry` and keeps only derived state: normalized weights,
//! predicted loads, the active strategy, and selection metrics.
//!
//! # Weights
//!
//! ```text
//! capability_weight = 1.0 × Π bonus(key = value)   e.g. os=linux ×1.2
//! load_weight       = 1 / (current_load + ε)
//! weight            = capability_weight × load_weight, normalized to sum 1
//! ```
//!
//! # Strategies
//!
//! | strategy               | picks                                          |
//! |------------------------|------------------------------------------------|
//! | `weighted_round_robin` | random draw proportional to weight             |
//! | `least_load`           | argmin current load                            |
//! | `least_connections`    | argmin active connections                      |
//! | `response_time`        | argmin mean response time (no samples = ∞)     |
//! | `predictive`           | argmin least-squares extrapolated load         |

pub mod balancer;
pub mod config;
pub mod metrics;
pub mod predict;
pub mod profiler;
pub mod prometheus;
pub mod select;
pub mod strategy;
pub mod weights;

pub use balancer::LoadBalancer;
pub use config::{BalancerConfig, CapabilityBonus};
pub use metrics::{MetricsSnapshot, NodeMetrics, NodeStats, StrategyMetrics};
pub use profiler::{
    Priority, Profiler, Recommendation, RecommendationKind, RecordingProfiler,
};
pub use prometheus::render_prometheus;
pub use strategy::{Strategy, UnknownStrategy};
