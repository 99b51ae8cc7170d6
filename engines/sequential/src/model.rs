//! Compiled layer sequence evaluated with ndarray.

use ndarray::{Array1, Array2, ArrayD, ArrayView1, ArrayViewD, Axis, Ix1, IxDyn, Zip};
use rayon::prelude::*;
use tracing::debug;

use inferbench_core::{Error, Result};

use crate::topology::{Activation, LayerSpec, ModelTopology, WeightEntry};

const ENGINE: &str = "sequential";

#[derive(Debug, Clone)]
enum Layer {
    Flatten,
    GlobalAveragePooling2d,
    Dense {
        /// `[units, in]`, one row per output unit
        weights: Array2<f32>,
        bias: Array1<f32>,
        activation: Activation,
    },
    /// Folded to `x * scale + shift` over the channel axis
    BatchNormalization {
        scale: Array1<f32>,
        shift: Array1<f32>,
    },
    Activation(Activation),
    Identity,
}

/// Model ready for inference on a single channels-last sample
#[derive(Debug, Clone)]
pub struct SequentialModel {
    name: String,
    layers: Vec<(String, Layer)>,
    input_shape: Vec<usize>,
    output_shape: Vec<usize>,
}

fn build_error(layer: &str, message: impl Into<String>) -> Error {
    Error::setup(ENGINE, format!("layer '{}': {}", layer, message.into()))
}

struct WeightTable<'a> {
    weights: &'a [f32],
    metadata: &'a [WeightEntry],
}

impl WeightTable<'_> {
    fn get(&self, layer: &str, weight: &str, shape: &[usize]) -> Result<&[f32]> {
        let entry = self
            .metadata
            .iter()
            .find(|e| e.layer_name == layer && e.weight_name == weight)
            .ok_or_else(|| build_error(layer, format!("missing weight '{}'", weight)))?;

        if entry.shape != shape {
            return Err(build_error(
                layer,
                format!(
                    "weight '{}' has shape {:?}, expected {:?}",
                    weight, entry.shape, shape
                ),
            ));
        }
        let elements = shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d));
        if elements != Some(entry.length) {
            return Err(build_error(
                layer,
                format!("weight '{}' length {} disagrees with its shape", weight, entry.length),
            ));
        }
        let outside = || {
            build_error(
                layer,
                format!(
                    "weight '{}' (offset {}, length {}) lies outside the weight buffer of {} elements",
                    weight,
                    entry.offset,
                    entry.length,
                    self.weights.len()
                ),
            )
        };
        let end = entry.offset.checked_add(entry.length).ok_or_else(outside)?;
        self.weights.get(entry.offset..end).ok_or_else(outside)
    }
}

impl SequentialModel {
    /// Resolve every layer's weights and check shapes from `input_shape` on
    pub fn build(
        topology: &ModelTopology,
        weights: &[f32],
        metadata: &[WeightEntry],
        input_shape: &[usize],
    ) -> Result<Self> {
        let table = WeightTable { weights, metadata };
        let mut shape = input_shape.to_vec();
        let mut layers = Vec::with_capacity(topology.layers.len());

        for spec in &topology.layers {
            let name = spec.name();
            let layer = match spec {
                LayerSpec::Flatten { .. } => {
                    shape = vec![shape.iter().product()];
                    Layer::Flatten
                }
                LayerSpec::GlobalAveragePooling2d { .. } => {
                    if shape.len() != 3 {
                        return Err(build_error(
                            name,
                            format!("expects a [height, width, channels] input, got {:?}", shape),
                        ));
                    }
                    shape = vec![shape[2]];
                    Layer::GlobalAveragePooling2d
                }
                LayerSpec::Dense {
                    units, activation, ..
                } => {
                    if shape.len() != 1 {
                        return Err(build_error(
                            name,
                            format!("expects a flat input, got {:?}", shape),
                        ));
                    }
                    let inputs = shape[0];
                    let kernel = table.get(name, "kernel", &[inputs, *units])?;
                    let bias = table.get(name, "bias", &[*units])?;
                    // Stored [in, units]; transpose so each unit owns a row
                    let kernel = Array2::from_shape_vec((inputs, *units), kernel.to_vec())
                        .map_err(|e| build_error(name, e.to_string()))?;
                    shape = vec![*units];
                    Layer::Dense {
                        weights: kernel.t().as_standard_layout().into_owned(),
                        bias: Array1::from(bias.to_vec()),
                        activation: *activation,
                    }
                }
                LayerSpec::BatchNormalization { epsilon, .. } => {
                    let channels = shape
                        .last()
                        .copied()
                        .ok_or_else(|| build_error(name, "expects at least one axis"))?;
                    let gamma = table.get(name, "gamma", &[channels])?;
                    let beta = table.get(name, "beta", &[channels])?;
                    let mean = table.get(name, "moving_mean", &[channels])?;
                    let variance = table.get(name, "moving_variance", &[channels])?;

                    let scale: Array1<f32> = gamma
                        .iter()
                        .zip(variance)
                        .map(|(g, v)| g / (v + epsilon).sqrt())
                        .collect();
                    let shift: Array1<f32> = beta
                        .iter()
                        .zip(mean)
                        .zip(scale.iter())
                        .map(|((b, m), s)| b - m * s)
                        .collect();
                    Layer::BatchNormalization { scale, shift }
                }
                LayerSpec::Activation { activation, .. } => Layer::Activation(*activation),
                LayerSpec::Dropout { .. } => Layer::Identity,
            };
            debug!(layer = name, output_shape = ?shape, "Built layer");
            layers.push((name.to_string(), layer));
        }

        Ok(Self {
            name: topology.name.clone(),
            layers,
            input_shape: input_shape.to_vec(),
            output_shape: shape,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    pub fn output_shape(&self) -> &[usize] {
        &self.output_shape
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Run every layer on `input`; `parallel` spreads dense rows over rayon
    pub fn predict(&self, input: ArrayViewD<'_, f32>, parallel: bool) -> Result<ArrayD<f32>> {
        if input.shape() != self.input_shape.as_slice() {
            return Err(Error::execution(
                ENGINE,
                format!(
                    "input shape {:?} does not match {:?}",
                    input.shape(),
                    self.input_shape
                ),
            ));
        }

        let mut x = input.to_owned();
        for (name, layer) in &self.layers {
            x = apply(layer, x, parallel)
                .map_err(|message| Error::execution(ENGINE, format!("layer '{}': {}", name, message)))?;
        }
        Ok(x)
    }
}

fn apply(layer: &Layer, x: ArrayD<f32>, parallel: bool) -> std::result::Result<ArrayD<f32>, String> {
    match layer {
        Layer::Flatten => Ok(Array1::from_iter(x.iter().copied()).into_dyn()),
        Layer::GlobalAveragePooling2d => x
            .mean_axis(Axis(0))
            .and_then(|rows| rows.mean_axis(Axis(0)))
            .ok_or_else(|| "cannot pool an empty feature map".to_string()),
        Layer::Dense {
            weights,
            bias,
            activation,
        } => {
            let x = x
                .into_dimensionality::<Ix1>()
                .map_err(|e| e.to_string())?;
            let mut y = if parallel {
                dense_parallel(weights, bias, x.view())
            } else {
                weights.dot(&x) + bias
            };
            apply_activation(*activation, y.as_slice_mut());
            Ok(y.into_dyn())
        }
        Layer::BatchNormalization { scale, shift } => {
            let mut x = x;
            let last = Axis(x.ndim() - 1);
            for mut lane in x.lanes_mut(last) {
                Zip::from(&mut lane)
                    .and(scale)
                    .and(shift)
                    .for_each(|v, &s, &b| *v = *v * s + b);
            }
            Ok(x)
        }
        Layer::Activation(activation) => {
            let mut x = x;
            if *activation == Activation::Softmax {
                let last = Axis(x.ndim().saturating_sub(1));
                for mut lane in x.lanes_mut(last) {
                    let mut values = lane.to_vec();
                    activation.apply_in_place(&mut values);
                    lane.iter_mut().zip(values).for_each(|(v, s)| *v = s);
                }
            } else {
                x.mapv_inplace(|v| {
                    let mut one = [v];
                    activation.apply_in_place(&mut one);
                    one[0]
                });
            }
            Ok(x)
        }
        Layer::Identity => Ok(x),
    }
}

fn dense_parallel(weights: &Array2<f32>, bias: &Array1<f32>, x: ArrayView1<'_, f32>) -> Array1<f32> {
    let values: Vec<f32> = (0..weights.nrows())
        .into_par_iter()
        .map(|unit| weights.row(unit).dot(&x) + bias[unit])
        .collect();
    Array1::from(values)
}

fn apply_activation(activation: Activation, values: Option<&mut [f32]>) {
    if let Some(values) = values {
        activation.apply_in_place(values);
    }
}

/// Zero-filled channels-last input for a square image
pub fn zero_input(resolution: usize) -> ArrayD<f32> {
    ArrayD::zeros(IxDyn(&[resolution, resolution, 3]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{tiny_topology, tiny_weights};

    fn tiny(input: usize) -> SequentialModel {
        let (weights, metadata) = tiny_weights(3, 16, 10);
        SequentialModel::build(&tiny_topology(16, 10), &weights, &metadata, &[input, input, 3])
            .unwrap()
    }

    #[test]
    fn test_output_is_a_distribution() {
        let model = tiny(8);
        let output = model.predict(zero_input(8).view(), false).unwrap();

        assert_eq!(output.shape(), &[10]);
        assert_eq!(model.output_shape(), &[10]);
        assert!((output.sum() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let model = tiny(5);
        let mut input = zero_input(5);
        input
            .iter_mut()
            .enumerate()
            .for_each(|(i, v)| *v = (i as f32 * 0.13).cos());

        let a = model.predict(input.view(), false).unwrap();
        let b = model.predict(input.view(), true).unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn test_batch_normalization_folds_statistics() {
        let topology = ModelTopology {
            name: "bn".to_string(),
            layers: vec![LayerSpec::BatchNormalization {
                name: "bn".to_string(),
                epsilon: 0.0,
            }],
        };
        let entry = |weight: &str, offset| WeightEntry {
            layer_name: "bn".to_string(),
            weight_name: weight.to_string(),
            offset,
            length: 2,
            shape: vec![2],
        };
        // gamma, beta, mean, variance
        let weights = [2.0, 1.0, 0.5, 0.0, 1.0, 1.0, 4.0, 1.0];
        let metadata = vec![
            entry("gamma", 0),
            entry("beta", 2),
            entry("moving_mean", 4),
            entry("moving_variance", 6),
        ];

        let model = SequentialModel::build(&topology, &weights, &metadata, &[1, 1, 2]).unwrap();
        let input = ArrayD::from_shape_vec(IxDyn(&[1, 1, 2]), vec![3.0, 3.0]).unwrap();
        let output = model.predict(input.view(), false).unwrap();

        // 3 * 2 / sqrt(4) + (0.5 - 1) = 2.5 and 3 * 1 / sqrt(1) + (0 - 1) = 2
        assert_eq!(output.iter().copied().collect::<Vec<_>>(), vec![2.5, 2.0]);
    }

    #[test]
    fn test_dense_on_feature_map_is_rejected() {
        let topology = ModelTopology {
            name: "bad".to_string(),
            layers: vec![LayerSpec::Dense {
                name: "fc".to_string(),
                units: 2,
                activation: Activation::Linear,
            }],
        };

        let err = SequentialModel::build(&topology, &[], &[], &[4, 4, 3]).unwrap_err();
        assert!(matches!(err, Error::Setup { .. }));
        assert!(err.to_string().contains("fc"));
    }

    #[test]
    fn test_weight_shape_mismatch_is_rejected() {
        let (weights, metadata) = tiny_weights(3, 16, 10);
        let err = SequentialModel::build(&tiny_topology(16, 12), &weights, &metadata, &[4, 4, 3])
            .unwrap_err();

        assert!(err.to_string().contains("shape"));
    }

    #[test]
    fn test_overflowing_weight_offset_fails_setup() {
        let topology = ModelTopology {
            name: "bn".to_string(),
            layers: vec![LayerSpec::BatchNormalization {
                name: "bn".to_string(),
                epsilon: 1e-3,
            }],
        };
        let metadata = vec![WeightEntry {
            layer_name: "bn".to_string(),
            weight_name: "gamma".to_string(),
            offset: usize::MAX - 3,
            length: 2,
            shape: vec![2],
        }];

        let err = SequentialModel::build(&topology, &[0.0; 8], &metadata, &[1, 1, 2]).unwrap_err();
        assert!(matches!(err, Error::Setup { .. }));
        assert!(err.to_string().contains("outside the weight buffer"));
    }

    #[test]
    fn test_wrong_input_shape_fails_execution() {
        let model = tiny(4);
        let err = model.predict(zero_input(5).view(), false).unwrap_err();
        assert!(matches!(err, Error::Execution { .. }));
    }
}
