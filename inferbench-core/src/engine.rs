//! Adapter contract between the runner and an inference engine.

use async_trait::async_trait;

use crate::error::Result;

/// An inference engine adapted to the runner's lifecycle hooks.
///
/// The runner calls `setup` once, `execute_one` once per timed iteration and
/// `finalize` exactly once afterwards, including when an earlier hook failed.
#[async_trait]
pub trait BenchmarkEngine: Send + Sync {
    /// Short engine kind used in logs and errors
    fn kind(&self) -> &'static str;

    /// Load the model and acquire the engine handle
    async fn setup(&mut self) -> Result<()>;

    /// Run a single inference against the pre-bound input
    async fn execute_one(&mut self) -> Result<()>;

    /// Release the engine handle; must be idempotent
    async fn finalize(&mut self) -> Result<()>;

    /// Whether the engine currently holds a loaded handle
    fn is_loaded(&self) -> bool;
}
