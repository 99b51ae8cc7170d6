//! Small multilayer perceptron artifacts for smoke runs and tests.

use inferbench_core::decoder::{encode_eightbit, encode_raw};
use inferbench_core::{Error, Extent, MemoryLayout, Placeholder, PlaceholderContext, Result};
use tracing::info;

use crate::descriptor::{GraphDescriptor, Kernel};
use crate::{DescriptorOptions, GraphArtifacts};

const F32: usize = 4;

/// `y = sigmoid(w2 · relu(w1 · x + b1) + b2)` with a symbolic batch size `N`
pub fn mlp_descriptor(
    inputs: usize,
    hidden: usize,
    outputs: usize,
    encoding: &str,
) -> Result<GraphDescriptor> {
    let mut layout = MemoryLayout::new();
    layout
        .push_static("w1", hidden * inputs * F32)
        .push_static("b1", hidden * F32)
        .push_static("w2", outputs * hidden * F32)
        .push_static("b2", outputs * F32);

    let tensors = [
        ("x", inputs),
        ("h", hidden),
        ("h_bias", hidden),
        ("h_relu", hidden),
        ("o", outputs),
        ("o_bias", outputs),
        ("y", outputs),
    ];
    let mut offset = 0;
    for (name, elements) in tensors {
        let bytes = elements * F32;
        layout.push_dynamic(name, per_sample(offset)?, per_sample(bytes)?);
        offset += bytes;
    }
    layout.set_dynamic_size(per_sample(offset)?);

    let s = |v: &str| v.to_string();
    let kernels = vec![
        Kernel::Linear {
            x: s("x"),
            w: s("w1"),
            y: s("h"),
            in_features: Some(inputs),
        },
        Kernel::Bias {
            x: s("h"),
            b: s("b1"),
            y: s("h_bias"),
        },
        Kernel::Relu {
            x: s("h_bias"),
            y: s("h_relu"),
        },
        Kernel::Linear {
            x: s("h_relu"),
            w: s("w2"),
            y: s("o"),
            in_features: Some(hidden),
        },
        Kernel::Bias {
            x: s("o"),
            b: s("b2"),
            y: s("o_bias"),
        },
        Kernel::Sigmoid {
            x: s("o_bias"),
            y: s("y"),
        },
    ];

    Ok(GraphDescriptor {
        memory_layout: layout,
        weight_encoding: encoding.to_string(),
        inputs: vec![s("x")],
        outputs: vec![s("y")],
        kernels,
        placeholders: PlaceholderContext::new().with("N", 1),
    })
}

/// `bytes` scaled by the batch placeholder
fn per_sample(bytes: usize) -> Result<Extent> {
    if bytes == 0 {
        return Ok(Extent::Value(0));
    }
    Ok(Placeholder::parse(&format!("N * {}", bytes))?.into())
}

/// Deterministic weights in static-region order: w1, b1, w2, b2
pub fn mlp_weights(inputs: usize, hidden: usize, outputs: usize) -> Vec<f32> {
    let count = hidden * inputs + hidden + outputs * hidden + outputs;
    (0..count).map(|i| (i as f32 * 0.7311).sin() * 0.5).collect()
}

/// Write a sample graph and weight blob where `options` expects them
pub async fn write_sample(options: &DescriptorOptions, encoding: &str) -> Result<GraphArtifacts> {
    let (inputs, hidden, outputs) = (64, 128, 10);
    let descriptor = mlp_descriptor(inputs, hidden, outputs, encoding)?;
    let values = mlp_weights(inputs, hidden, outputs);
    let weights = match encoding {
        "raw" => encode_raw(&values),
        "eightbit" => encode_eightbit(&values),
        other => return Err(Error::UnsupportedEncoding(other.to_string())),
    };

    let artifacts = options.artifacts();
    if let Some(dir) = artifacts.graph.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    let json = serde_json::to_vec_pretty(&descriptor)
        .map_err(|e| Error::validation(format!("Failed to serialize descriptor: {}", e)))?;
    tokio::fs::write(&artifacts.graph, json).await?;
    tokio::fs::write(&artifacts.weights, weights).await?;

    info!(
        graph = %artifacts.graph.display(),
        weights = %artifacts.weights.display(),
        encoding,
        "Wrote sample descriptor artifacts"
    );
    Ok(artifacts)
}
