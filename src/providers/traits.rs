//! Core traits for the provider-based service architecture.

use anyhow::Result;
use async_trait::async_trait;

use crate::task_manager::TaskManager;

/// Asynchronously builds a shared component.
#[async_trait]
pub trait AsyncProvider<T> {
    async fn provide(&self) -> Result<T>;
}

/// A long-running service started by the coordinator.
///
/// Services start in descending `priority()` order. A critical service that
/// fails to start aborts startup; a non-critical one is logged and skipped.
#[async_trait]
pub trait ServiceProvider: Send + Sync {
    /// Spawns the service's task(s) on the task manager.
    async fn start(&self, task_manager: &mut TaskManager) -> Result<()>;

    fn name(&self) -> &'static str;

    fn priority(&self) -> i32 {
        0
    }

    fn is_critical(&self) -> bool {
        false
    }
}
