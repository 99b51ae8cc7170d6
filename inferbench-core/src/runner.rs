//! Four-phase benchmark lifecycle: setup, timed iterations, finalize, summarize.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, instrument, warn};

use crate::config::RunnerConfig;
use crate::engine::BenchmarkEngine;
use crate::error::{Error, Result};
use crate::models::{RunState, Summary};
use crate::progress::{LogSink, ProgressSink};
use crate::registry::BenchmarkVariant;
use crate::stats::summarize;

/// Smallest iteration count that leaves a sample after the warm-up is dropped
pub const MIN_ITERATIONS: usize = 2;

/// Drives one variant at a time through the benchmark lifecycle
pub struct BenchmarkRunner {
    cooldown: Duration,
    sink: Arc<dyn ProgressSink>,
}

impl Default for BenchmarkRunner {
    fn default() -> Self {
        Self::from_config(&RunnerConfig::default(), Arc::new(LogSink))
    }
}

impl BenchmarkRunner {
    /// Create a runner with an explicit cooldown between iterations
    pub fn new(cooldown: Duration, sink: Arc<dyn ProgressSink>) -> Self {
        Self { cooldown, sink }
    }

    /// Create a runner from the runner section of the configuration
    pub fn from_config(config: &RunnerConfig, sink: Arc<dyn ProgressSink>) -> Self {
        Self::new(config.cooldown(), sink)
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Benchmark `variant` for `iterations` timed executions.
    ///
    /// Any failure aborts the remaining phases. The engine is finalized
    /// before the error is returned, and no partial summary is produced.
    #[instrument(skip_all, fields(variant = %variant.name(), iterations = iterations))]
    pub async fn run(&self, variant: &mut BenchmarkVariant, iterations: usize) -> Result<Summary> {
        let name = variant.name().to_string();

        if iterations < MIN_ITERATIONS {
            let err = Error::InvalidIterations {
                requested: iterations,
                minimum: MIN_ITERATIONS,
            };
            error!("{}", err);
            self.sink.message(&format!("{}: {}", name, err));
            return Err(err);
        }

        let (engine, state) = variant.parts_mut();
        state.mark_running(iterations);

        let outcome = self.drive(&name, engine, state, iterations).await;
        let released = engine.finalize().await;
        debug!("Engine released (loaded: {})", engine.is_loaded());

        let result = match (outcome, released) {
            (Ok(()), Ok(())) => summarize(&name, &state.timings),
            (Ok(()), Err(err)) => Err(Error::finalize(engine.kind(), err)),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(finalize_err)) => {
                warn!("Finalize after failure also failed: {}", finalize_err);
                Err(err)
            }
        };

        match result {
            Ok(summary) => {
                info!("{}", summary);
                self.sink.message(&summary.to_string());
                state.mark_completed(summary.clone());
                Ok(summary)
            }
            Err(err) => {
                error!("Benchmark aborted: {}", err);
                self.sink.message(&format!("{} aborted: {}", name, err));
                state.mark_failed(err.to_string());
                Err(err)
            }
        }
    }

    async fn drive(
        &self,
        name: &str,
        engine: &mut dyn BenchmarkEngine,
        state: &mut RunState,
        iterations: usize,
    ) -> Result<()> {
        self.sink
            .message(&format!("Setting up {} ({})", name, engine.kind()));
        engine.setup().await?;

        for i in 0..iterations {
            self.sink.progress(name, i, iterations);
            if !self.cooldown.is_zero() {
                tokio::time::sleep(self.cooldown).await;
            }

            let start = Instant::now();
            engine.execute_one().await?;
            let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

            debug!(iteration = i, elapsed_ms, "Iteration finished");
            state.record(elapsed_ms);
        }
        self.sink.progress(name, iterations, iterations);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RunStatus;
    use crate::progress::MockProgressSink;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counters {
        setups: AtomicUsize,
        executions: AtomicUsize,
        finalizes: AtomicUsize,
    }

    /// Engine that fails on demand and counts hook calls
    struct ScriptedEngine {
        counters: Arc<Counters>,
        handle: Option<Vec<f32>>,
        fail_setup: bool,
        fail_on_execution: Option<usize>,
        fail_finalize: bool,
    }

    impl ScriptedEngine {
        fn new(counters: Arc<Counters>) -> Self {
            Self {
                counters,
                handle: None,
                fail_setup: false,
                fail_on_execution: None,
                fail_finalize: false,
            }
        }
    }

    #[async_trait]
    impl BenchmarkEngine for ScriptedEngine {
        fn kind(&self) -> &'static str {
            "scripted"
        }

        async fn setup(&mut self) -> Result<()> {
            self.counters.setups.fetch_add(1, Ordering::SeqCst);
            if self.fail_setup {
                return Err(Error::setup("scripted", "missing model"));
            }
            self.handle = Some(vec![0.0; 16]);
            Ok(())
        }

        async fn execute_one(&mut self) -> Result<()> {
            let n = self.counters.executions.fetch_add(1, Ordering::SeqCst);
            if self.fail_on_execution == Some(n) {
                return Err(Error::execution("scripted", "inference rejected"));
            }
            match self.handle.as_mut() {
                Some(buffer) => {
                    buffer[0] += 1.0;
                    Ok(())
                }
                None => Err(Error::execution("scripted", "not loaded")),
            }
        }

        async fn finalize(&mut self) -> Result<()> {
            self.counters.finalizes.fetch_add(1, Ordering::SeqCst);
            self.handle = None;
            if self.fail_finalize {
                return Err(Error::execution("scripted", "device lost"));
            }
            Ok(())
        }

        fn is_loaded(&self) -> bool {
            self.handle.is_some()
        }
    }

    fn quiet_runner() -> BenchmarkRunner {
        let mut sink = MockProgressSink::new();
        sink.expect_progress().return_const(());
        sink.expect_message().return_const(());
        BenchmarkRunner::new(Duration::ZERO, Arc::new(sink))
    }

    #[tokio::test]
    async fn test_runs_exactly_n_executions() {
        let counters = Arc::new(Counters::default());
        let mut variant =
            BenchmarkVariant::new("scripted", Box::new(ScriptedEngine::new(counters.clone())));

        let summary = quiet_runner().run(&mut variant, 5).await.unwrap();

        assert_eq!(counters.setups.load(Ordering::SeqCst), 1);
        assert_eq!(counters.executions.load(Ordering::SeqCst), 5);
        assert_eq!(counters.finalizes.load(Ordering::SeqCst), 1);
        assert_eq!(variant.state.timings.len(), 5);
        assert_eq!(summary.samples.len(), 4);
        assert!(summary.samples.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(variant.state.status, RunStatus::Completed);
        assert_eq!(variant.state.summary.as_ref(), Some(&summary));
        assert!(!variant.engine().is_loaded());
    }

    #[tokio::test]
    async fn test_progress_is_reported_every_iteration() {
        let mut sink = MockProgressSink::new();
        sink.expect_progress()
            .withf(|_, _, total| *total == 3)
            .times(4)
            .return_const(());
        sink.expect_message().return_const(());
        let runner = BenchmarkRunner::new(Duration::ZERO, Arc::new(sink));

        let counters = Arc::new(Counters::default());
        let mut variant =
            BenchmarkVariant::new("scripted", Box::new(ScriptedEngine::new(counters)));

        runner.run(&mut variant, 3).await.unwrap();
    }

    #[tokio::test]
    async fn test_too_few_iterations_rejected_before_setup() {
        let counters = Arc::new(Counters::default());
        let mut variant =
            BenchmarkVariant::new("scripted", Box::new(ScriptedEngine::new(counters.clone())));

        let err = quiet_runner().run(&mut variant, 1).await.unwrap_err();

        assert!(matches!(
            err,
            Error::InvalidIterations {
                requested: 1,
                minimum: 2
            }
        ));
        assert_eq!(counters.setups.load(Ordering::SeqCst), 0);
        assert_eq!(counters.executions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_setup_failure_aborts_before_timing() {
        let counters = Arc::new(Counters::default());
        let mut engine = ScriptedEngine::new(counters.clone());
        engine.fail_setup = true;
        let mut variant = BenchmarkVariant::new("scripted", Box::new(engine));

        let err = quiet_runner().run(&mut variant, 4).await.unwrap_err();

        assert!(matches!(err, Error::Setup { .. }));
        assert_eq!(counters.executions.load(Ordering::SeqCst), 0);
        assert!(variant.state.timings.is_empty());
        assert_eq!(variant.state.status, RunStatus::Failed);
        assert!(variant.state.summary.is_none());
    }

    #[tokio::test]
    async fn test_execution_failure_releases_handle_before_error() {
        let counters = Arc::new(Counters::default());
        let mut engine = ScriptedEngine::new(counters.clone());
        engine.fail_on_execution = Some(2);
        let mut variant = BenchmarkVariant::new("scripted", Box::new(engine));

        let err = quiet_runner().run(&mut variant, 5).await.unwrap_err();

        assert!(matches!(err, Error::Execution { .. }));
        assert_eq!(counters.executions.load(Ordering::SeqCst), 3);
        assert_eq!(counters.finalizes.load(Ordering::SeqCst), 1);
        assert!(!variant.engine().is_loaded());
        assert_eq!(variant.state.timings.len(), 2);
        assert_eq!(variant.state.status, RunStatus::Failed);
        assert!(variant.state.summary.is_none());
        assert!(variant
            .state
            .error
            .as_deref()
            .unwrap()
            .contains("inference rejected"));
    }

    #[tokio::test]
    async fn test_finalize_failure_after_clean_run() {
        let counters = Arc::new(Counters::default());
        let mut engine = ScriptedEngine::new(counters.clone());
        engine.fail_finalize = true;
        let mut variant = BenchmarkVariant::new("scripted", Box::new(engine));

        let err = quiet_runner().run(&mut variant, 3).await.unwrap_err();

        assert!(matches!(&err, Error::Finalize { engine, message }
            if engine == "scripted" && message.contains("device lost")));
        assert_eq!(variant.state.status, RunStatus::Failed);
        assert!(variant.state.summary.is_none());
    }

    #[tokio::test]
    async fn test_execution_error_wins_over_finalize_error() {
        let counters = Arc::new(Counters::default());
        let mut engine = ScriptedEngine::new(counters.clone());
        engine.fail_on_execution = Some(0);
        engine.fail_finalize = true;
        let mut variant = BenchmarkVariant::new("scripted", Box::new(engine));

        let err = quiet_runner().run(&mut variant, 3).await.unwrap_err();

        assert!(matches!(err, Error::Execution { .. }));
        assert_eq!(counters.finalizes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_variant_can_be_rerun() {
        let counters = Arc::new(Counters::default());
        let mut variant =
            BenchmarkVariant::new("scripted", Box::new(ScriptedEngine::new(counters.clone())));
        let runner = quiet_runner();

        let first = runner.run(&mut variant, 2).await.unwrap();
        let second = runner.run(&mut variant, 3).await.unwrap();

        assert_ne!(first.run_id, second.run_id);
        assert_eq!(second.samples.len(), 2);
        assert_eq!(counters.setups.load(Ordering::SeqCst), 2);
        assert_eq!(counters.executions.load(Ordering::SeqCst), 5);
    }
}
