//! Tensor graph: built once, evaluated per inference.

use ndarray::{Array, Array1, Array2, Array3, Array4, Dimension, ShapeBuilder};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use inferbench_core::{Error, Result};

use crate::memory::MemoryScope;
use crate::ops;

const ENGINE: &str = "resnet";
const BN_EPSILON: f32 = 1e-5;

/// Handle to a node of the graph under construction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeId(usize);

#[derive(Debug, Clone)]
enum Op {
    Input,
    Conv2d {
        input: usize,
        weights: Array4<f32>,
        stride: usize,
        padding: usize,
    },
    BatchNorm {
        input: usize,
        scale: Array1<f32>,
        shift: Array1<f32>,
    },
    Relu {
        input: usize,
    },
    MaxPool {
        input: usize,
        size: usize,
        stride: usize,
        padding: usize,
    },
    Add {
        lhs: usize,
        rhs: usize,
    },
    GlobalAvgPool {
        input: usize,
    },
    Dense {
        input: usize,
        weights: Array2<f32>,
        bias: Array1<f32>,
    },
}

impl Op {
    fn inputs(&self) -> Vec<usize> {
        match self {
            Op::Input => Vec::new(),
            Op::Add { lhs, rhs } => vec![*lhs, *rhs],
            Op::Conv2d { input, .. }
            | Op::BatchNorm { input, .. }
            | Op::Relu { input }
            | Op::MaxPool { input, .. }
            | Op::GlobalAvgPool { input }
            | Op::Dense { input, .. } => vec![*input],
        }
    }
}

#[derive(Debug, Clone)]
struct Node {
    name: String,
    op: Op,
    shape: (usize, usize, usize),
}

/// Builds a graph with He-initialised parameters from a seeded generator
#[derive(Debug)]
pub struct GraphBuilder {
    nodes: Vec<Node>,
    rng: StdRng,
    parameters: usize,
}

impl GraphBuilder {
    pub fn new(seed: u64) -> Self {
        Self {
            nodes: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
            parameters: 0,
        }
    }

    fn shape(&self, node: NodeId) -> Result<(usize, usize, usize)> {
        self.nodes
            .get(node.0)
            .map(|n| n.shape)
            .ok_or_else(|| Error::not_found(format!("graph node {}", node.0)))
    }

    fn push(&mut self, name: impl Into<String>, op: Op, shape: (usize, usize, usize)) -> NodeId {
        self.nodes.push(Node {
            name: name.into(),
            op,
            shape,
        });
        NodeId(self.nodes.len() - 1)
    }

    /// Uniform He initialisation, bound `sqrt(6 / fan_in)`
    fn he_uniform<Sh, D>(&mut self, shape: Sh, fan_in: usize) -> Array<f32, D>
    where
        Sh: ShapeBuilder<Dim = D>,
        D: Dimension,
    {
        let bound = (6.0 / fan_in.max(1) as f32).sqrt();
        let rng = &mut self.rng;
        let weights = Array::from_shape_simple_fn(shape, || rng.gen_range(-bound..bound));
        self.parameters += weights.len();
        weights
    }

    pub fn input(&mut self, channels: usize, height: usize, width: usize) -> NodeId {
        self.push("input", Op::Input, (channels, height, width))
    }

    pub fn conv2d(
        &mut self,
        name: &str,
        input: NodeId,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
    ) -> Result<NodeId> {
        let (in_channels, height, width) = self.shape(input)?;
        let out_h = ops::output_len(height, kernel, stride, padding);
        let out_w = ops::output_len(width, kernel, stride, padding);
        let (out_h, out_w) = match (out_h, out_w) {
            (Some(h), Some(w)) => (h, w),
            _ => {
                return Err(Error::setup(
                    ENGINE,
                    format!(
                        "{}: {}x{} kernel does not fit a {}x{} input",
                        name, kernel, kernel, height, width
                    ),
                ))
            }
        };

        let weights: Array4<f32> = self.he_uniform(
            (out_channels, in_channels, kernel, kernel),
            in_channels * kernel * kernel,
        );
        let op = Op::Conv2d {
            input: input.0,
            weights,
            stride,
            padding,
        };
        Ok(self.push(name, op, (out_channels, out_h, out_w)))
    }

    /// Inference-mode batch norm with unit variance and zero mean statistics
    pub fn batch_norm(&mut self, name: &str, input: NodeId) -> Result<NodeId> {
        let shape = self.shape(input)?;
        let scale = Array1::from_elem(shape.0, 1.0 / (1.0 + BN_EPSILON).sqrt());
        let shift = Array1::zeros(shape.0);
        self.parameters += 4 * shape.0;
        let op = Op::BatchNorm {
            input: input.0,
            scale,
            shift,
        };
        Ok(self.push(name, op, shape))
    }

    pub fn relu(&mut self, name: &str, input: NodeId) -> Result<NodeId> {
        let shape = self.shape(input)?;
        Ok(self.push(name, Op::Relu { input: input.0 }, shape))
    }

    pub fn max_pool(
        &mut self,
        name: &str,
        input: NodeId,
        size: usize,
        stride: usize,
        padding: usize,
    ) -> Result<NodeId> {
        let (channels, height, width) = self.shape(input)?;
        match (
            ops::output_len(height, size, stride, padding),
            ops::output_len(width, size, stride, padding),
        ) {
            (Some(h), Some(w)) if padding < size => {
                let op = Op::MaxPool {
                    input: input.0,
                    size,
                    stride,
                    padding,
                };
                Ok(self.push(name, op, (channels, h, w)))
            }
            _ => Err(Error::setup(
                ENGINE,
                format!("{}: cannot pool a {}x{} input", name, height, width),
            )),
        }
    }

    pub fn add(&mut self, name: &str, lhs: NodeId, rhs: NodeId) -> Result<NodeId> {
        let (a, b) = (self.shape(lhs)?, self.shape(rhs)?);
        if a != b {
            return Err(Error::setup(
                ENGINE,
                format!("{}: cannot add {:?} and {:?}", name, a, b),
            ));
        }
        Ok(self.push(name, Op::Add { lhs: lhs.0, rhs: rhs.0 }, a))
    }

    pub fn global_avg_pool(&mut self, name: &str, input: NodeId) -> Result<NodeId> {
        let (channels, _, _) = self.shape(input)?;
        Ok(self.push(name, Op::GlobalAvgPool { input: input.0 }, (channels, 1, 1)))
    }

    pub fn dense(&mut self, name: &str, input: NodeId, units: usize) -> Result<NodeId> {
        let (c, h, w) = self.shape(input)?;
        let features = c * h * w;
        let weights: Array2<f32> = self.he_uniform((units, features), features);
        let bias = Array1::zeros(units);
        self.parameters += units;
        let op = Op::Dense {
            input: input.0,
            weights,
            bias,
        };
        Ok(self.push(name, op, (units, 1, 1)))
    }

    /// Freeze the graph with `output` as its result
    pub fn finish(self, output: NodeId) -> Result<Graph> {
        if output.0 >= self.nodes.len() {
            return Err(Error::not_found(format!("graph node {}", output.0)));
        }
        let mut consumers = vec![0; self.nodes.len()];
        for node in &self.nodes {
            for input in node.op.inputs() {
                consumers[input] += 1;
            }
        }
        debug!(
            nodes = self.nodes.len(),
            parameters = self.parameters,
            "Graph built"
        );
        Ok(Graph {
            nodes: self.nodes,
            consumers,
            output: output.0,
            parameters: self.parameters,
        })
    }
}

/// Immutable graph; nodes are stored in topological order
#[derive(Debug, Clone)]
pub struct Graph {
    nodes: Vec<Node>,
    consumers: Vec<usize>,
    output: usize,
    parameters: usize,
}

impl Graph {
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn parameter_count(&self) -> usize {
        self.parameters
    }

    pub fn input_shape(&self) -> Option<(usize, usize, usize)> {
        self.nodes
            .iter()
            .find(|n| matches!(n.op, Op::Input))
            .map(|n| n.shape)
    }

    pub fn output_shape(&self) -> (usize, usize, usize) {
        self.nodes[self.output].shape
    }

    /// Evaluate the output node.
    ///
    /// Intermediates live in `scope` and are released as soon as their last
    /// consumer has run; the output stays in the scope until it is dropped.
    pub fn evaluate(
        &self,
        input: &Array3<f32>,
        scope: &mut MemoryScope<'_>,
        parallel: bool,
    ) -> Result<Array1<f32>> {
        let mut remaining = self.consumers.clone();

        for (id, node) in self.nodes.iter().enumerate() {
            let value = match &node.op {
                Op::Input => {
                    if input.dim() != node.shape {
                        return Err(Error::execution(
                            ENGINE,
                            format!("input shape {:?} does not match {:?}", input.dim(), node.shape),
                        ));
                    }
                    input.clone()
                }
                Op::Conv2d {
                    input,
                    weights,
                    stride,
                    padding,
                } => ops::conv2d(scope.get(*input)?, weights, *stride, *padding, parallel),
                Op::BatchNorm {
                    input,
                    scale,
                    shift,
                } => ops::batch_norm(scope.get(*input)?, scale, shift),
                Op::Relu { input } => ops::relu(scope.get(*input)?),
                Op::MaxPool {
                    input,
                    size,
                    stride,
                    padding,
                } => ops::max_pool(scope.get(*input)?, *size, *stride, *padding),
                Op::Add { lhs, rhs } => ops::add(scope.get(*lhs)?, scope.get(*rhs)?),
                Op::GlobalAvgPool { input } => ops::global_avg_pool(scope.get(*input)?),
                Op::Dense {
                    input,
                    weights,
                    bias,
                } => ops::dense(scope.get(*input)?, weights, bias),
            };
            scope.insert(id, value)?;

            for input in node.op.inputs() {
                remaining[input] -= 1;
                if remaining[input] == 0 && input != self.output {
                    scope.release(input);
                }
            }
            if id == self.output {
                break;
            }
        }

        let output = scope.get(self.output)?;
        debug!(
            node = %self.nodes[self.output].name,
            live_bytes = scope.live_bytes(),
            "Graph evaluated"
        );
        Ok(output.iter().copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTracker;

    fn small_graph(seed: u64) -> Graph {
        let mut builder = GraphBuilder::new(seed);
        let x = builder.input(2, 6, 6);
        let conv = builder.conv2d("conv", x, 4, 3, 1, 1).unwrap();
        let bn = builder.batch_norm("bn", conv).unwrap();
        let act = builder.relu("relu", bn).unwrap();
        let skip = builder.conv2d("skip", x, 4, 1, 1, 0).unwrap();
        let sum = builder.add("add", act, skip).unwrap();
        let pool = builder.global_avg_pool("gap", sum).unwrap();
        let fc = builder.dense("fc", pool, 3).unwrap();
        builder.finish(fc).unwrap()
    }

    #[test]
    fn test_shapes_and_parameters() {
        let graph = small_graph(7);

        assert_eq!(graph.node_count(), 8);
        assert_eq!(graph.input_shape(), Some((2, 6, 6)));
        assert_eq!(graph.output_shape(), (3, 1, 1));
        assert_eq!(graph.parameter_count(), 4 * 2 * 9 + 16 + 4 * 2 + 3 * 4 + 3);
    }

    #[test]
    fn test_same_seed_same_output() {
        let input = Array3::from_shape_fn((2, 6, 6), |(c, y, x)| (c + y * x) as f32 * 0.1);
        let tracker = MemoryTracker::new();

        let mut outputs = Vec::new();
        for seed in [1, 1, 2] {
            let graph = small_graph(seed);
            let mut scope = tracker.scope(graph.node_count());
            outputs.push(graph.evaluate(&input, &mut scope, false).unwrap());
        }

        assert_eq!(outputs[0], outputs[1]);
        assert_ne!(outputs[0], outputs[2]);
        assert_eq!(tracker.live_bytes(), 0);
    }

    #[test]
    fn test_intermediates_released_early() {
        let graph = small_graph(3);
        let tracker = MemoryTracker::new();
        let mut scope = tracker.scope(graph.node_count());

        graph
            .evaluate(&Array3::zeros((2, 6, 6)), &mut scope, true)
            .unwrap();

        // only the 3-element output is still held
        assert_eq!(scope.live_bytes(), 12);
        assert!(tracker.peak_bytes() > 12);
        drop(scope);
        assert_eq!(tracker.live_bytes(), 0);
    }

    #[test]
    fn test_invalid_graphs_fail() {
        let mut builder = GraphBuilder::new(0);
        let x = builder.input(1, 4, 4);
        assert!(builder.conv2d("big", x, 1, 7, 1, 0).is_err());

        let a = builder.conv2d("a", x, 2, 1, 1, 0).unwrap();
        let b = builder.conv2d("b", x, 2, 1, 2, 0).unwrap();
        assert!(matches!(builder.add("sum", a, b), Err(Error::Setup { .. })));
    }

    #[test]
    fn test_wrong_input_shape() {
        let graph = small_graph(0);
        let tracker = MemoryTracker::new();
        let mut scope = tracker.scope(graph.node_count());

        let err = graph
            .evaluate(&Array3::zeros((3, 6, 6)), &mut scope, false)
            .unwrap_err();
        assert!(matches!(err, Error::Execution { .. }));
    }
}
