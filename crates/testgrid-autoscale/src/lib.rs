//! testgrid-autoscale — grows and shrinks the worker fleet.
//!
//! Every monitoring tick records a `ScalingSnapshot`, prunes snapshots
//! older than the metrics window and evaluates:
//!
//! ```text
//! utilization = (workers − available) / workers        (0 with no workers)
//!
//! if utilization > up_threshold and pending > 0 and workers < max:
//!     ScaleUp   by min(max − workers, max(1, round(workers × 0.5)))
//!
//! if utilization < down_threshold and workers > min:
//!     ScaleDown by min(workers − min, max(1, round(workers × 0.25)))
//! ```
//!
//! Nothing is requested within the cooldown after the last *successful*
//! scaling call. Provisioning goes through a `FleetProvider`; its errors
//! are logged and the next tick may try again.

pub mod config;
pub mod provider;
pub mod scaler;

pub use config::AutoscaleConfig;
pub use provider::{FleetProvider, FleetStatus};
pub use scaler::{AutoScaler, ScaleDecision, ScalingReport, ScalingSnapshot, evaluate};
