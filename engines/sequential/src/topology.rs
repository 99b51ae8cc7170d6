//! On-disk model description: topology and weight metadata.

use serde::{Deserialize, Serialize};

/// Contents of `model.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelTopology {
    pub name: String,
    pub layers: Vec<LayerSpec>,
}

/// One layer, tagged by class name with its configuration alongside
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class_name", content = "config", rename_all = "snake_case")]
pub enum LayerSpec {
    Flatten {
        name: String,
    },
    #[serde(rename = "global_average_pooling_2d")]
    GlobalAveragePooling2d {
        name: String,
    },
    Dense {
        name: String,
        units: usize,
        #[serde(default)]
        activation: Activation,
    },
    BatchNormalization {
        name: String,
        #[serde(default = "default_epsilon")]
        epsilon: f32,
    },
    Activation {
        name: String,
        activation: Activation,
    },
    Dropout {
        name: String,
        #[serde(default)]
        rate: f32,
    },
}

fn default_epsilon() -> f32 {
    1e-3
}

impl LayerSpec {
    pub fn name(&self) -> &str {
        match self {
            LayerSpec::Flatten { name }
            | LayerSpec::GlobalAveragePooling2d { name }
            | LayerSpec::Dense { name, .. }
            | LayerSpec::BatchNormalization { name, .. }
            | LayerSpec::Activation { name, .. }
            | LayerSpec::Dropout { name, .. } => name,
        }
    }
}

/// Element-wise or vector activation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Relu,
    Sigmoid,
    Tanh,
    /// Applied over the last axis, shifted by the maximum for stability
    Softmax,
    #[default]
    Linear,
}

impl Activation {
    pub fn apply_in_place(self, values: &mut [f32]) {
        match self {
            Activation::Relu => values.iter_mut().for_each(|v| *v = v.max(0.0)),
            Activation::Sigmoid => values
                .iter_mut()
                .for_each(|v| *v = 1.0 / (1.0 + (-*v).exp())),
            Activation::Tanh => values.iter_mut().for_each(|v| *v = v.tanh()),
            Activation::Softmax => {
                let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let mut sum = 0.0;
                for v in values.iter_mut() {
                    *v = (*v - max).exp();
                    sum += *v;
                }
                if sum > 0.0 {
                    values.iter_mut().for_each(|v| *v /= sum);
                }
            }
            Activation::Linear => {}
        }
    }
}

/// One entry of `model_metadata.json`; offset and length count `f32` elements
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightEntry {
    pub layer_name: String,
    pub weight_name: String,
    pub offset: usize,
    pub length: usize,
    pub shape: Vec<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_layers() {
        let json = r#"{
            "name": "tiny",
            "layers": [
                {"class_name": "global_average_pooling_2d", "config": {"name": "gap"}},
                {"class_name": "dense", "config": {"name": "fc", "units": 4, "activation": "relu"}},
                {"class_name": "batch_normalization", "config": {"name": "bn"}},
                {"class_name": "dropout", "config": {"name": "drop", "rate": 0.5}}
            ]
        }"#;

        let topology: ModelTopology = serde_json::from_str(json).unwrap();

        assert_eq!(topology.layers.len(), 4);
        assert_eq!(topology.layers[1].name(), "fc");
        assert!(matches!(
            topology.layers[1],
            LayerSpec::Dense {
                units: 4,
                activation: Activation::Relu,
                ..
            }
        ));
        assert!(matches!(
            topology.layers[2],
            LayerSpec::BatchNormalization { epsilon, .. } if (epsilon - 1e-3).abs() < 1e-9
        ));
    }

    #[test]
    fn test_softmax_is_a_distribution() {
        let mut values = [1.0, 2.0, 3.0, 1000.0];
        Activation::Softmax.apply_in_place(&mut values);

        assert!((values.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(values[3] > 0.99);
        assert!(values.iter().all(|v| v.is_finite()));
    }
}
