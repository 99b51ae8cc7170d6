use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

pub mod capabilities;
pub mod config;
pub mod decoder;
pub mod engine;
pub mod error;
pub mod layout;
pub mod models;
pub mod progress;
pub mod registry;
pub mod runner;
pub mod stats;

/// Re-export common types and functions
pub use capabilities::Capabilities;
pub use config::{Config, VariantConfig};
pub use decoder::{decoder_for, WeightDecoder};
pub use engine::BenchmarkEngine;
pub use error::{Error, Result};
pub use layout::{Extent, MemoryLayout, Placeholder, PlaceholderContext};
pub use models::{RunStatus, Summary};
pub use progress::{LogSink, ProgressSink};
pub use registry::{BenchmarkVariant, VariantRegistry};
pub use runner::BenchmarkRunner;

/// Inferbench version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Listing entry for a registered variant
#[derive(Debug, Clone, Serialize)]
pub struct VariantInfo {
    pub name: String,
    pub engine: &'static str,
    pub description: Option<String>,
    pub status: RunStatus,
    pub last_summary: Option<Summary>,
}

/// Entry point owning the configuration, the variant registry and the runner
pub struct InferBench {
    config: Arc<RwLock<Config>>,
    registry: Mutex<VariantRegistry>,
    runner: BenchmarkRunner,
}

impl InferBench {
    /// Create a new instance around a registry built during initialisation
    pub async fn new(
        config: Config,
        registry: VariantRegistry,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<Self> {
        let runner = BenchmarkRunner::from_config(&config.runner, sink);
        info!(
            "Initialised with {} variants (cooldown {:?})",
            registry.len(),
            runner.cooldown()
        );

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            registry: Mutex::new(registry),
            runner,
        })
    }

    /// Get a copy of the configuration
    pub async fn config(&self) -> Result<Config> {
        let config = self.config.read().await;
        Ok(config.clone())
    }

    /// Describe every registered variant
    pub async fn variants(&self) -> Vec<VariantInfo> {
        let registry = self.registry.lock().await;
        registry
            .iter()
            .map(|v| VariantInfo {
                name: v.name().to_string(),
                engine: v.engine().kind(),
                description: v.description().map(str::to_string),
                status: v.state.status,
                last_summary: v.state.summary.clone(),
            })
            .collect()
    }

    /// Benchmark one variant; `iterations` defaults to the configured count.
    ///
    /// Variants run one at a time: the registry stays locked for the whole run.
    pub async fn run_variant(&self, name: &str, iterations: Option<usize>) -> Result<Summary> {
        let iterations = match iterations {
            Some(n) => n,
            None => self.config.read().await.runner.iterations,
        };

        let mut registry = self.registry.lock().await;
        let variant = registry.get_mut(name)?;
        self.runner.run(variant, iterations).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct CountingEngine {
        loaded: bool,
    }

    #[async_trait]
    impl BenchmarkEngine for CountingEngine {
        fn kind(&self) -> &'static str {
            "counting"
        }

        async fn setup(&mut self) -> Result<()> {
            self.loaded = true;
            Ok(())
        }

        async fn execute_one(&mut self) -> Result<()> {
            Ok(())
        }

        async fn finalize(&mut self) -> Result<()> {
            self.loaded = false;
            Ok(())
        }

        fn is_loaded(&self) -> bool {
            self.loaded
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.runner.iterations = 3;
        config.runner.cooldown_ms = 0;
        config
    }

    #[tokio::test]
    async fn test_run_variant_uses_configured_iterations() {
        let mut registry = VariantRegistry::new();
        registry
            .register(BenchmarkVariant::new(
                "counting",
                Box::new(CountingEngine { loaded: false }),
            ))
            .unwrap();
        let bench = InferBench::new(test_config(), registry, Arc::new(LogSink))
            .await
            .unwrap();

        let summary = bench.run_variant("counting", None).await.unwrap();
        assert_eq!(summary.samples.len(), 2);

        let variants = bench.variants().await;
        assert_eq!(variants.len(), 1);
        assert_eq!(variants[0].engine, "counting");
        assert_eq!(variants[0].status, RunStatus::Completed);
        assert_eq!(variants[0].last_summary.as_ref(), Some(&summary));
    }

    #[tokio::test]
    async fn test_unknown_variant() {
        let bench = InferBench::new(test_config(), VariantRegistry::new(), Arc::new(LogSink))
            .await
            .unwrap();

        let err = bench.run_variant("missing", Some(2)).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(bench.config().await.unwrap().environment.is_some());
    }
}
