//! A small pooled classifier in the on-disk model format.

use inferbench_core::decoder::encode_raw;
use inferbench_core::{Error, Result};
use tracing::info;

use crate::topology::{Activation, LayerSpec, ModelTopology, WeightEntry};
use crate::{ModelFiles, SequentialOptions};

/// Pool, normalize and classify: `gap → bn → fc1 → dropout → fc2 → softmax`
pub fn tiny_topology(hidden: usize, classes: usize) -> ModelTopology {
    let name = |n: &str| n.to_string();
    ModelTopology {
        name: name("tiny"),
        layers: vec![
            LayerSpec::GlobalAveragePooling2d { name: name("gap") },
            LayerSpec::BatchNormalization {
                name: name("bn"),
                epsilon: 1e-3,
            },
            LayerSpec::Dense {
                name: name("fc1"),
                units: hidden,
                activation: Activation::Relu,
            },
            LayerSpec::Dropout {
                name: name("dropout"),
                rate: 0.2,
            },
            LayerSpec::Dense {
                name: name("fc2"),
                units: classes,
                activation: Activation::Linear,
            },
            LayerSpec::Activation {
                name: name("softmax"),
                activation: Activation::Softmax,
            },
        ],
    }
}

/// Deterministic weights for [`tiny_topology`] and their metadata
pub fn tiny_weights(channels: usize, hidden: usize, classes: usize) -> (Vec<f32>, Vec<WeightEntry>) {
    let mut weights = Vec::new();
    let mut metadata = Vec::new();
    let mut push = |layer: &str, weight: &str, shape: Vec<usize>, fill: &dyn Fn(usize) -> f32| {
        let length = shape.iter().product();
        metadata.push(WeightEntry {
            layer_name: layer.to_string(),
            weight_name: weight.to_string(),
            offset: weights.len(),
            length,
            shape,
        });
        weights.extend((0..length).map(fill));
    };

    push("bn", "gamma", vec![channels], &|_| 1.0);
    push("bn", "beta", vec![channels], &|i| i as f32 * 0.1);
    push("bn", "moving_mean", vec![channels], &|_| 0.0);
    push("bn", "moving_variance", vec![channels], &|i| 1.0 + i as f32 * 0.5);
    push("fc1", "kernel", vec![channels, hidden], &|i| (i as f32 * 0.37).sin() * 0.3);
    push("fc1", "bias", vec![hidden], &|i| (i as f32 * 0.11).cos() * 0.05);
    push("fc2", "kernel", vec![hidden, classes], &|i| (i as f32 * 0.53).sin() * 0.2);
    push("fc2", "bias", vec![classes], &|_| 0.0);

    (weights, metadata)
}

/// Write the tiny classifier where `options` expects its files
pub async fn write_sample(options: &SequentialOptions) -> Result<ModelFiles> {
    let (weights, metadata) = tiny_weights(3, 64, 10);
    let files = options.files();
    if let Some(dir) = files.topology.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }

    let topology = serde_json::to_vec_pretty(&tiny_topology(64, 10))
        .map_err(|e| Error::validation(format!("Failed to serialize topology: {}", e)))?;
    let metadata = serde_json::to_vec_pretty(&metadata)
        .map_err(|e| Error::validation(format!("Failed to serialize metadata: {}", e)))?;
    tokio::fs::write(&files.topology, topology).await?;
    tokio::fs::write(&files.weights, encode_raw(&weights)).await?;
    tokio::fs::write(&files.metadata, metadata).await?;

    info!(dir = ?files.topology.parent(), "Wrote sample sequential model");
    Ok(files)
}
