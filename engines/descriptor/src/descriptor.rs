//! Serialized graph descriptor.

use inferbench_core::{MemoryLayout, PlaceholderContext};
use serde::{Deserialize, Serialize};

/// Precompiled graph: memory layout, kernel sequence and I/O names
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDescriptor {
    pub memory_layout: MemoryLayout,
    /// Encoding of the weight blob, see `inferbench_core::decoder`
    #[serde(default = "default_encoding")]
    pub weight_encoding: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub kernels: Vec<Kernel>,
    /// Default placeholder bindings, overridable at load time
    #[serde(default)]
    pub placeholders: PlaceholderContext,
}

fn default_encoding() -> String {
    "raw".to_string()
}

/// One kernel invocation; operands name allocations in the memory layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Kernel {
    /// `y = x · wᵀ`, row-major `w` of shape `[out, in]`
    Linear {
        x: String,
        w: String,
        y: String,
        /// Inner dimension; defaults to the whole of `x` (batch of one)
        #[serde(default)]
        in_features: Option<usize>,
    },
    /// `y = x + b`, `b` broadcast over trailing axis
    Bias { x: String, b: String, y: String },
    /// `y = x0 + x1`
    ElementwiseSum { x0: String, x1: String, y: String },
    /// `y = x0 * x1`
    ElementwiseMul { x0: String, x1: String, y: String },
    /// Join row-major `xs` along `axis`; `shapes[i]` is the shape of `xs[i]`
    Concat {
        xs: Vec<String>,
        y: String,
        axis: usize,
        shapes: Vec<Vec<usize>>,
    },
    Relu { x: String, y: String },
    Sigmoid { x: String, y: String },
    Tanh { x: String, y: String },
    Copy { x: String, y: String },
}

impl Kernel {
    pub fn name(&self) -> &'static str {
        match self {
            Kernel::Linear { .. } => "linear",
            Kernel::Bias { .. } => "bias",
            Kernel::ElementwiseSum { .. } => "elementwise_sum",
            Kernel::ElementwiseMul { .. } => "elementwise_mul",
            Kernel::Concat { .. } => "concat",
            Kernel::Relu { .. } => "relu",
            Kernel::Sigmoid { .. } => "sigmoid",
            Kernel::Tanh { .. } => "tanh",
            Kernel::Copy { .. } => "copy",
        }
    }

    /// Output allocation name
    pub fn output(&self) -> &str {
        match self {
            Kernel::Linear { y, .. }
            | Kernel::Bias { y, .. }
            | Kernel::ElementwiseSum { y, .. }
            | Kernel::ElementwiseMul { y, .. }
            | Kernel::Concat { y, .. }
            | Kernel::Relu { y, .. }
            | Kernel::Sigmoid { y, .. }
            | Kernel::Tanh { y, .. }
            | Kernel::Copy { y, .. } => y,
        }
    }
}
