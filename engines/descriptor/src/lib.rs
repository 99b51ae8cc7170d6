//! Benchmark engine running a precompiled graph descriptor.
//!
//! A model is compiled ahead of time into two artifacts per backend: a JSON
//! graph descriptor (memory layout, kernel sequence, I/O names) and a weight
//! blob in one of the core weight encodings.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;
use inferbench_core::{BenchmarkEngine, Error, PlaceholderContext, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

mod descriptor;
mod runtime;
mod sample;

pub use descriptor::{GraphDescriptor, Kernel};
pub use runtime::DescriptorRunner;
pub use sample::{mlp_descriptor, mlp_weights, write_sample};

const ENGINE: &str = "descriptor";

/// Execution backend; each has its own compiled artifacts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Data parallel kernels on the rayon pool
    Threaded,
    /// Sequential kernels over precompiled buffer ranges
    #[default]
    Native,
    /// Indexed loops, operands resolved on every run
    Fallback,
}

impl Backend {
    pub const ALL: [Backend; 3] = [Backend::Threaded, Backend::Native, Backend::Fallback];

    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Threaded => "threaded",
            Backend::Native => "native",
            Backend::Fallback => "fallback",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Backend::ALL
            .into_iter()
            .find(|b| b.as_str() == s)
            .ok_or_else(|| {
                Error::validation(format!(
                    "Unknown backend '{}', expected one of threaded, native, fallback",
                    s
                ))
            })
    }
}

/// Engine options as they appear under a variant's settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptorOptions {
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub backend: Backend,
    #[serde(default = "default_optimized")]
    pub optimized: bool,
    /// Overrides for the descriptor's placeholder bindings
    #[serde(default)]
    pub placeholders: PlaceholderContext,
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("artifacts/descriptor")
}

fn default_model() -> String {
    "mlp".to_string()
}

fn default_optimized() -> bool {
    true
}

impl Default for DescriptorOptions {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            model: default_model(),
            backend: Backend::default(),
            optimized: default_optimized(),
            placeholders: PlaceholderContext::new(),
        }
    }
}

/// Paths of the two artifacts for one backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphArtifacts {
    pub graph: PathBuf,
    pub weights: PathBuf,
}

impl DescriptorOptions {
    /// `<base_dir>/<optimized|non_optimized>/<model>/{graph,weight}_<backend>.*`
    pub fn artifacts(&self) -> GraphArtifacts {
        let flavour = if self.optimized {
            "optimized"
        } else {
            "non_optimized"
        };
        let dir = self.base_dir.join(flavour).join(&self.model);
        GraphArtifacts {
            graph: dir.join(format!("graph_{}.json", self.backend)),
            weights: dir.join(format!("weight_{}.bin", self.backend)),
        }
    }
}

/// Descriptor runtime adapted to the runner hooks
#[derive(Debug)]
pub struct DescriptorEngine {
    options: DescriptorOptions,
    runner: Option<DescriptorRunner>,
}

impl DescriptorEngine {
    pub fn new(options: DescriptorOptions) -> Self {
        Self {
            options,
            runner: None,
        }
    }

    pub fn options(&self) -> &DescriptorOptions {
        &self.options
    }

    /// The loaded runner, if setup has completed
    pub fn runner(&self) -> Option<&DescriptorRunner> {
        self.runner.as_ref()
    }
}

#[async_trait]
impl BenchmarkEngine for DescriptorEngine {
    fn kind(&self) -> &'static str {
        ENGINE
    }

    async fn setup(&mut self) -> Result<()> {
        let artifacts = self.options.artifacts();
        debug!(graph = %artifacts.graph.display(), "Loading graph descriptor");

        let json = tokio::fs::read(&artifacts.graph).await.map_err(|e| {
            Error::setup_with_source(
                ENGINE,
                format!("cannot read {}", artifacts.graph.display()),
                e,
            )
        })?;
        let descriptor: GraphDescriptor = serde_json::from_slice(&json).map_err(|e| {
            Error::setup_with_source(
                ENGINE,
                format!("malformed descriptor {}", artifacts.graph.display()),
                e,
            )
        })?;
        let weights = tokio::fs::read(&artifacts.weights).await.map_err(|e| {
            Error::setup_with_source(
                ENGINE,
                format!("cannot read {}", artifacts.weights.display()),
                e,
            )
        })?;

        let runner = DescriptorRunner::load(
            descriptor,
            &weights,
            self.options.backend,
            &self.options.placeholders,
        )
        .await
        .map_err(|e| match e {
            Error::Setup { .. } => e,
            other => Error::setup_with_source(ENGINE, "failed to load graph", other),
        })?;

        info!(
            model = %self.options.model,
            backend = %self.options.backend,
            required_heap = runner.required_heap(),
            "Descriptor engine ready"
        );
        self.runner = Some(runner);
        Ok(())
    }

    async fn execute_one(&mut self) -> Result<()> {
        let runner = self
            .runner
            .as_mut()
            .ok_or_else(|| Error::execution(ENGINE, "engine is not loaded"))?;
        runner.run()
    }

    async fn finalize(&mut self) -> Result<()> {
        if self.runner.take().is_some() {
            debug!(model = %self.options.model, "Released descriptor runner");
        }
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.runner.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn options_in(dir: &TempDir, backend: Backend) -> DescriptorOptions {
        DescriptorOptions {
            base_dir: dir.path().to_path_buf(),
            backend,
            ..Default::default()
        }
    }

    #[test]
    fn test_artifact_paths() {
        let options = DescriptorOptions {
            base_dir: PathBuf::from("models"),
            model: "resnet50".to_string(),
            backend: Backend::Threaded,
            optimized: false,
            placeholders: PlaceholderContext::new(),
        };

        let artifacts = options.artifacts();
        assert_eq!(
            artifacts.graph,
            PathBuf::from("models/non_optimized/resnet50/graph_threaded.json")
        );
        assert_eq!(
            artifacts.weights,
            PathBuf::from("models/non_optimized/resnet50/weight_threaded.bin")
        );
        assert_eq!(options.artifacts(), artifacts);
    }

    #[test]
    fn test_options_from_settings() {
        let options: DescriptorOptions = serde_json::from_value(serde_json::json!({
            "model": "mlp",
            "backend": "fallback",
            "placeholders": {"N": 4}
        }))
        .unwrap();

        assert_eq!(options.backend, Backend::Fallback);
        assert!(options.optimized);
        assert_eq!(options.placeholders.get("N"), Some(4));

        let bad = serde_json::from_value::<DescriptorOptions>(serde_json::json!({
            "backend": "webgl"
        }));
        assert!(bad.is_err());
        assert!("webgl".parse::<Backend>().is_err());
        assert_eq!("native".parse::<Backend>().unwrap(), Backend::Native);
    }

    #[tokio::test]
    async fn test_lifecycle_on_every_backend() {
        let dir = TempDir::new().unwrap();
        for backend in Backend::ALL {
            let options = options_in(&dir, backend);
            write_sample(&options, "eightbit").await.unwrap();

            let mut engine = DescriptorEngine::new(options);
            assert!(!engine.is_loaded());

            engine.setup().await.unwrap();
            assert!(engine.is_loaded());
            engine.execute_one().await.unwrap();
            engine.execute_one().await.unwrap();

            let output = engine.runner().unwrap().tensor("y").unwrap();
            assert_eq!(output.len(), 10);
            assert!(output.iter().all(|v| *v > 0.0 && *v < 1.0));

            engine.finalize().await.unwrap();
            assert!(!engine.is_loaded());
            engine.finalize().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_missing_artifacts_fail_setup() {
        let dir = TempDir::new().unwrap();
        let mut engine = DescriptorEngine::new(options_in(&dir, Backend::Native));

        let err = engine.setup().await.unwrap_err();
        assert!(matches!(err, Error::Setup { .. }));
        assert!(!engine.is_loaded());
    }

    #[tokio::test]
    async fn test_unsupported_encoding_fails_setup() {
        let dir = TempDir::new().unwrap();
        let options = options_in(&dir, Backend::Native);
        let artifacts = write_sample(&options, "raw").await.unwrap();

        let mut descriptor: GraphDescriptor =
            serde_json::from_slice(&std::fs::read(&artifacts.graph).unwrap()).unwrap();
        descriptor.weight_encoding = "zstd".to_string();
        std::fs::write(&artifacts.graph, serde_json::to_vec(&descriptor).unwrap()).unwrap();

        let mut engine = DescriptorEngine::new(options);
        let err = engine.setup().await.unwrap_err();
        assert!(err.to_string().contains("descriptor"));
        assert!(matches!(err, Error::Setup { .. }));
    }

    #[tokio::test]
    async fn test_execute_before_setup_fails() {
        let mut engine = DescriptorEngine::new(DescriptorOptions::default());
        let err = engine.execute_one().await.unwrap_err();
        assert!(matches!(err, Error::Execution { .. }));
    }

    #[tokio::test]
    async fn test_placeholder_override_sets_batch() {
        let dir = TempDir::new().unwrap();
        let mut options = options_in(&dir, Backend::Native);
        write_sample(&options, "raw").await.unwrap();
        options.placeholders.bind("N", 3);

        let mut engine = DescriptorEngine::new(options);
        engine.setup().await.unwrap();
        engine.execute_one().await.unwrap();
        assert_eq!(engine.runner().unwrap().tensor("y").unwrap().len(), 30);
    }
}
