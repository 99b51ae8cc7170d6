//! Benchmark engine for a residual image classifier.
//!
//! The network is built in process against a small tensor graph engine with
//! seeded random weights, so it needs no artifacts on disk.

use std::sync::Arc;

use async_trait::async_trait;
use inferbench_core::{BenchmarkEngine, Error, Result};
use ndarray::{Array1, Array3};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

mod graph;
mod memory;
mod network;
mod ops;

pub use graph::{Graph, GraphBuilder, NodeId};
pub use memory::{MemoryScope, MemoryTracker};
pub use network::{build_resnet, ResNetConfig};

const ENGINE: &str = "resnet";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Cpu,
    /// Convolutions spread over output channels on the rayon pool
    Gpu,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResNetOptions {
    #[serde(default)]
    pub backend: Backend,
    #[serde(flatten)]
    pub network: ResNetConfig,
}

#[derive(Debug)]
struct Loaded {
    graph: Graph,
    input: Array3<f32>,
    logits: Option<Array1<f32>>,
}

/// Residual network adapted to the runner hooks
#[derive(Debug)]
pub struct ResNetEngine {
    options: ResNetOptions,
    tracker: Arc<MemoryTracker>,
    loaded: Option<Loaded>,
}

impl ResNetEngine {
    pub fn new(options: ResNetOptions) -> Self {
        Self {
            options,
            tracker: Arc::new(MemoryTracker::new()),
            loaded: None,
        }
    }

    pub fn options(&self) -> &ResNetOptions {
        &self.options
    }

    /// Memory counters for intermediate tensors
    pub fn memory(&self) -> &MemoryTracker {
        &self.tracker
    }

    pub fn graph(&self) -> Option<&Graph> {
        self.loaded.as_ref().map(|l| &l.graph)
    }

    /// Logits of the most recent execution
    pub fn last_logits(&self) -> Option<&Array1<f32>> {
        self.loaded.as_ref().and_then(|l| l.logits.as_ref())
    }
}

#[async_trait]
impl BenchmarkEngine for ResNetEngine {
    fn kind(&self) -> &'static str {
        ENGINE
    }

    async fn setup(&mut self) -> Result<()> {
        let config = self.options.network.clone();
        let graph = tokio::task::spawn_blocking(move || build_resnet(&config))
            .await
            .map_err(|e| Error::setup_with_source(ENGINE, "graph construction panicked", e))?
            .map_err(|e| match e {
                Error::Setup { .. } => e,
                other => Error::setup_with_source(ENGINE, "invalid network options", other),
            })?;

        let size = self.options.network.input_size;
        info!(
            backend = ?self.options.backend,
            nodes = graph.node_count(),
            parameters = graph.parameter_count(),
            input_size = size,
            "ResNet engine ready"
        );
        self.loaded = Some(Loaded {
            graph,
            input: Array3::zeros((3, size, size)),
            logits: None,
        });
        Ok(())
    }

    async fn execute_one(&mut self) -> Result<()> {
        let parallel = self.options.backend == Backend::Gpu;
        let loaded = self
            .loaded
            .as_mut()
            .ok_or_else(|| Error::execution(ENGINE, "engine is not loaded"))?;

        let logits = {
            let mut scope = self.tracker.scope(loaded.graph.node_count());
            loaded.graph.evaluate(&loaded.input, &mut scope, parallel)?
        };
        debug!(
            peak_bytes = self.tracker.peak_bytes(),
            live_bytes = self.tracker.live_bytes(),
            "Inference complete"
        );
        loaded.logits = Some(logits);
        Ok(())
    }

    async fn finalize(&mut self) -> Result<()> {
        if self.loaded.take().is_some() {
            debug!("Released ResNet graph");
        }
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny(backend: Backend) -> ResNetOptions {
        ResNetOptions {
            backend,
            network: ResNetConfig {
                input_size: 24,
                base_width: 4,
                blocks_per_stage: vec![1, 2],
                classes: 6,
                seed: 5,
            },
        }
    }

    #[test]
    fn test_options_from_flat_settings() {
        let options: ResNetOptions = serde_json::from_value(serde_json::json!({
            "backend": "gpu",
            "input_size": 64,
            "seed": 9
        }))
        .unwrap();

        assert_eq!(options.backend, Backend::Gpu);
        assert_eq!(options.network.input_size, 64);
        assert_eq!(options.network.base_width, 64);
        assert_eq!(options.network.classes, 1000);
        assert_eq!(options.network.seed, 9);
    }

    #[tokio::test]
    async fn test_lifecycle_releases_memory() {
        let mut engine = ResNetEngine::new(tiny(Backend::Cpu));
        engine.setup().await.unwrap();

        for _ in 0..3 {
            engine.execute_one().await.unwrap();
            assert_eq!(engine.memory().live_bytes(), 0);
        }
        assert!(engine.memory().peak_bytes() > 0);
        assert_eq!(engine.last_logits().unwrap().len(), 6);

        engine.finalize().await.unwrap();
        assert!(!engine.is_loaded());
        engine.finalize().await.unwrap();
    }

    #[tokio::test]
    async fn test_cpu_and_gpu_agree() {
        let mut results = Vec::new();
        for backend in [Backend::Cpu, Backend::Gpu] {
            let mut engine = ResNetEngine::new(tiny(backend));
            engine.setup().await.unwrap();
            engine.execute_one().await.unwrap();
            results.push(engine.last_logits().unwrap().clone());
        }
        assert_eq!(results[0], results[1]);
    }

    #[tokio::test]
    async fn test_invalid_options_fail_setup() {
        let mut options = tiny(Backend::Cpu);
        options.network.blocks_per_stage.clear();

        let mut engine = ResNetEngine::new(options);
        let err = engine.setup().await.unwrap_err();
        assert!(matches!(err, Error::Setup { .. }));
        assert!(!engine.is_loaded());
    }
}
