//! Worker execution boundary.

use async_trait::async_trait;
use testgrid_core::TaskResult;
use testgrid_scheduler::Assignment;

/// Runs one assigned task on its worker and reports how it went.
///
/// The coordinator spawns each call, so implementations may take as long
/// as the task takes. Transport errors should come back as an
/// `Error`-status result rather than a panic.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, assignment: &Assignment) -> TaskResult;
}
