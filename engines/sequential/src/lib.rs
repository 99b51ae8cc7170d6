//! Benchmark engine for layer-sequence image models.
//!
//! A model is three files under `<base_dir>/<model>/`: the topology
//! (`model.json`), a little-endian `f32` weight buffer (`model_weights.buf`)
//! and per-weight metadata (`model_metadata.json`).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use inferbench_core::decoder::RawDecoder;
use inferbench_core::{BenchmarkEngine, Error, MemoryLayout, Result, WeightDecoder};
use ndarray::ArrayD;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

mod model;
mod sample;
mod topology;

pub use model::{zero_input, SequentialModel};
pub use sample::{tiny_topology, tiny_weights, write_sample};
pub use topology::{Activation, LayerSpec, ModelTopology, WeightEntry};

const ENGINE: &str = "sequential";

/// Input resolutions of the models with a well-known input size
pub const KNOWN_MODELS: [(&str, usize); 2] = [("resnet50", 224), ("inception_v3", 299)];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequentialOptions {
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    #[serde(default = "default_model")]
    pub model: String,
    /// Square input size; required for models outside [`KNOWN_MODELS`]
    #[serde(default)]
    pub resolution: Option<usize>,
    /// Evaluate dense layers on the rayon pool
    #[serde(default)]
    pub gpu: bool,
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("artifacts/sequential")
}

fn default_model() -> String {
    "resnet50".to_string()
}

impl Default for SequentialOptions {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            model: default_model(),
            resolution: None,
            gpu: false,
        }
    }
}

/// The three files making up a model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFiles {
    pub topology: PathBuf,
    pub weights: PathBuf,
    pub metadata: PathBuf,
}

impl SequentialOptions {
    pub fn files(&self) -> ModelFiles {
        let dir = self.base_dir.join(&self.model);
        ModelFiles {
            topology: dir.join("model.json"),
            weights: dir.join("model_weights.buf"),
            metadata: dir.join("model_metadata.json"),
        }
    }

    /// Explicit resolution, else the known size of the named model
    pub fn resolution(&self) -> Result<usize> {
        if let Some(resolution) = self.resolution {
            if resolution == 0 {
                return Err(Error::setup(ENGINE, "resolution must be positive"));
            }
            return Ok(resolution);
        }
        KNOWN_MODELS
            .iter()
            .find(|(name, _)| *name == self.model)
            .map(|(_, resolution)| *resolution)
            .ok_or_else(|| {
                Error::setup(
                    ENGINE,
                    format!(
                        "unknown model '{}': set a resolution or use one of resnet50, inception_v3",
                        self.model
                    ),
                )
            })
    }
}

#[derive(Debug)]
struct Loaded {
    model: SequentialModel,
    input: ArrayD<f32>,
    output: Option<ArrayD<f32>>,
}

/// Layer-sequence runtime adapted to the runner hooks
#[derive(Debug)]
pub struct SequentialEngine {
    options: SequentialOptions,
    loaded: Option<Loaded>,
}

impl SequentialEngine {
    pub fn new(options: SequentialOptions) -> Self {
        Self {
            options,
            loaded: None,
        }
    }

    pub fn options(&self) -> &SequentialOptions {
        &self.options
    }

    pub fn model(&self) -> Option<&SequentialModel> {
        self.loaded.as_ref().map(|l| &l.model)
    }

    /// Output of the most recent execution
    pub fn last_output(&self) -> Option<&ArrayD<f32>> {
        self.loaded.as_ref().and_then(|l| l.output.as_ref())
    }
}

async fn read_file(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path).await.map_err(|e| {
        Error::setup_with_source(ENGINE, format!("cannot read {}", path.display()), e)
    })
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = read_file(path).await?;
    serde_json::from_slice(&bytes).map_err(|e| {
        Error::setup_with_source(ENGINE, format!("malformed {}", path.display()), e)
    })
}

/// Decode the whole weight buffer as one static allocation
async fn decode_weights(bytes: &[u8]) -> Result<Vec<f32>> {
    let mut layout = MemoryLayout::new();
    layout.push_static("weights", bytes.len());
    RawDecoder
        .decode(bytes, &layout)
        .await
        .map_err(|e| Error::setup_with_source(ENGINE, "cannot decode model_weights.buf", e))
}

#[async_trait]
impl BenchmarkEngine for SequentialEngine {
    fn kind(&self) -> &'static str {
        ENGINE
    }

    async fn setup(&mut self) -> Result<()> {
        let resolution = self.options.resolution()?;
        let files = self.options.files();
        debug!(topology = %files.topology.display(), resolution, "Loading sequential model");

        let topology: ModelTopology = read_json(&files.topology).await?;
        let metadata: Vec<WeightEntry> = read_json(&files.metadata).await?;
        let weights = decode_weights(&read_file(&files.weights).await?).await?;

        let input = zero_input(resolution);
        let model = SequentialModel::build(&topology, &weights, &metadata, input.shape())?;
        info!(
            model = %self.options.model,
            layers = model.layer_count(),
            resolution,
            gpu = self.options.gpu,
            "Sequential engine ready"
        );

        self.loaded = Some(Loaded {
            model,
            input,
            output: None,
        });
        Ok(())
    }

    async fn execute_one(&mut self) -> Result<()> {
        let loaded = self
            .loaded
            .as_mut()
            .ok_or_else(|| Error::execution(ENGINE, "engine is not loaded"))?;
        let output = loaded.model.predict(loaded.input.view(), self.options.gpu)?;
        loaded.output = Some(output);
        Ok(())
    }

    async fn finalize(&mut self) -> Result<()> {
        if self.loaded.take().is_some() {
            debug!(model = %self.options.model, "Released sequential model");
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
    use tempfile::TempDir;

    fn options_in(dir: &TempDir, gpu: bool) -> SequentialOptions {
        SequentialOptions {
            base_dir: dir.path().to_path_buf(),
            model: "tiny".to_string(),
            resolution: Some(12),
            gpu,
        }
    }

    #[test]
    fn test_resolution_rules() {
        let mut options = SequentialOptions::default();
        assert_eq!(options.resolution().unwrap(), 224);

        options.model = "inception_v3".to_string();
        assert_eq!(options.resolution().unwrap(), 299);

        options.model = "mobilenet".to_string();
        assert!(matches!(options.resolution(), Err(Error::Setup { .. })));

        options.resolution = Some(96);
        assert_eq!(options.resolution().unwrap(), 96);
    }

    #[test]
    fn test_file_paths() {
        let files = SequentialOptions::default().files();
        assert_eq!(
            files.metadata,
            PathBuf::from("artifacts/sequential/resnet50/model_metadata.json")
        );
        assert_eq!(files.weights.file_name().unwrap(), "model_weights.buf");
    }

    #[tokio::test]
    async fn test_lifecycle_cpu_and_gpu() {
        let dir = TempDir::new().unwrap();
        write_sample(&options_in(&dir, false)).await.unwrap();

        let mut outputs = Vec::new();
        for gpu in [false, true] {
            let mut engine = SequentialEngine::new(options_in(&dir, gpu));
            engine.setup().await.unwrap();
            assert!(engine.is_loaded());
            assert_eq!(engine.model().unwrap().input_shape(), &[12, 12, 3]);

            engine.execute_one().await.unwrap();
            let output = engine.last_output().unwrap().clone();
            assert_eq!(output.len(), 10);
            assert!((output.sum() - 1.0).abs() < 1e-5);
            outputs.push(output);

            engine.finalize().await.unwrap();
            assert!(!engine.is_loaded());
        }

        for (a, b) in outputs[0].iter().zip(outputs[1].iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[tokio::test]
    async fn test_unknown_model_fails_setup_before_reading() {
        let dir = TempDir::new().unwrap();
        let mut options = options_in(&dir, false);
        options.resolution = None;

        let mut engine = SequentialEngine::new(options);
        let err = engine.setup().await.unwrap_err();
        assert!(err.to_string().contains("unknown model"));
        assert!(!engine.is_loaded());
    }

    #[tokio::test]
    async fn test_truncated_weights_fail_setup() {
        let dir = TempDir::new().unwrap();
        let files = write_sample(&options_in(&dir, false)).await.unwrap();
        let mut bytes = std::fs::read(&files.weights).unwrap();
        bytes.truncate(bytes.len() - 6);
        std::fs::write(&files.weights, bytes).unwrap();

        let mut engine = SequentialEngine::new(options_in(&dir, false));
        let err = engine.setup().await.unwrap_err();
        assert!(matches!(err, Error::Setup { .. }));
    }
}
