//! Fleet provisioning boundary.

use async_trait::async_trait;
use serde::Serialize;

/// Size and health of the provisioned fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FleetStatus {
    pub current: usize,
    pub healthy: usize,
}

/// Provisions or releases worker capacity.
///
/// Implementations own retries; the autoscaler only logs failures.
#[async_trait]
pub trait FleetProvider: Send + Sync {
    /// Request a fleet of `target` workers.
    async fn scale_to(&self, target: usize) -> anyhow::Result<()>;

    async fn status(&self) -> anyhow::Result<FleetStatus>;
}
