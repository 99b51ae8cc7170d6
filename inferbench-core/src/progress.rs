//! Progress reporting sinks.

use tracing::info;

#[cfg(test)]
use mockall::automock;

/// Receives progress notifications while a variant is being benchmarked
#[cfg_attr(test, automock)]
pub trait ProgressSink: Send + Sync {
    /// Called before each iteration and once after the last one
    fn progress(&self, name: &str, completed: usize, total: usize);

    /// Free-form status line
    fn message(&self, line: &str);
}

/// Sink that forwards everything to the tracing log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ProgressSink for LogSink {
    fn progress(&self, name: &str, completed: usize, total: usize) {
        info!(variant = name, "Running {}/{}", completed, total);
    }

    fn message(&self, line: &str) {
        info!("{}", line);
    }
}
