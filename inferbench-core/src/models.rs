use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a completed run
pub type RunId = Uuid;

/// Run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Variant has not been run yet
    Idle,

    /// Variant is currently being benchmarked
    Running,

    /// Last run produced a summary
    Completed,

    /// Last run aborted
    Failed,
}

/// Summary of one completed run
///
/// `samples` holds the retained timings in milliseconds, warm-up sample
/// removed and sorted ascending.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Summary {
    /// Unique identifier for the run
    pub run_id: RunId,

    /// Variant name
    pub name: String,

    /// Arithmetic mean in milliseconds
    pub mean_ms: f64,

    /// Sample standard deviation in milliseconds
    pub std_ms: f64,

    /// Retained samples in milliseconds
    pub samples: Vec<f64>,

    /// Completion time
    pub completed_at: DateTime<Utc>,
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} : {:.2}+-{:.2}ms", self.name, self.mean_ms, self.std_ms)
    }
}

/// Mutable run state owned by a variant
#[derive(Debug, Clone, Serialize)]
pub struct RunState {
    /// Current status
    pub status: RunStatus,

    /// Iterations requested for the current or last run
    pub iterations: usize,

    /// Raw per-iteration timings in milliseconds, warm-up included
    pub timings: Vec<f64>,

    /// Summary of the last completed run
    pub summary: Option<Summary>,

    /// Start time of the current or last run
    pub started_at: Option<DateTime<Utc>>,

    /// Completion time of the last run
    pub completed_at: Option<DateTime<Utc>>,

    /// Error message if the last run failed
    pub error: Option<String>,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            status: RunStatus::Idle,
            iterations: 0,
            timings: Vec::new(),
            summary: None,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }
}

impl RunState {
    /// Reset the state for a new run
    pub fn mark_running(&mut self, iterations: usize) {
        self.status = RunStatus::Running;
        self.iterations = iterations;
        self.timings = Vec::with_capacity(iterations);
        self.summary = None;
        self.error = None;
        self.started_at = Some(Utc::now());
        self.completed_at = None;
    }

    /// Record one timed iteration
    pub fn record(&mut self, elapsed_ms: f64) {
        self.timings.push(elapsed_ms);
    }

    /// Mark the run as completed
    pub fn mark_completed(&mut self, summary: Summary) {
        self.status = RunStatus::Completed;
        self.completed_at = Some(summary.completed_at);
        self.summary = Some(summary);
    }

    /// Mark the run as failed
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = RunStatus::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(Utc::now());
    }
}
