//! Executes a graph descriptor over a single flat data buffer.

use std::ops::Range;

use inferbench_core::decoder::decoder_for;
use inferbench_core::{Error, MemoryLayout, PlaceholderContext, Result};
use rayon::prelude::*;
use tracing::{debug, info};

use crate::descriptor::{GraphDescriptor, Kernel};
use crate::Backend;

const ENGINE: &str = "descriptor";
const HEAP_GRANULE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Op {
    Linear { in_features: usize },
    Add,
    Mul,
    /// Elements each input contributes to one row of the output
    Concat { segments: Vec<usize> },
    Relu,
    Sigmoid,
    Tanh,
    Copy,
}

/// Kernel with operands resolved to element ranges of the data buffer
#[derive(Debug, Clone)]
struct Step {
    op: Op,
    inputs: Vec<Range<usize>>,
    output: Range<usize>,
}

/// Loaded graph ready to run
#[derive(Debug)]
pub struct DescriptorRunner {
    backend: Backend,
    layout: MemoryLayout,
    kernels: Vec<Kernel>,
    plan: Vec<(Step, Vec<f32>)>,
    data: Vec<f32>,
    inputs: Vec<String>,
    outputs: Vec<String>,
    required_heap: usize,
}

impl DescriptorRunner {
    /// Bind placeholders, decode the weights and compile the kernel sequence.
    ///
    /// `overrides` take precedence over the descriptor's own bindings.
    pub async fn load(
        descriptor: GraphDescriptor,
        weights: &[u8],
        backend: Backend,
        overrides: &PlaceholderContext,
    ) -> Result<Self> {
        let mut ctx = descriptor.placeholders.clone();
        ctx.extend(overrides);
        let layout = descriptor.memory_layout.bind(&ctx)?;

        let decoder = decoder_for(&descriptor.weight_encoding)?;
        let data = decoder.decode(weights, &layout).await?;

        for name in descriptor.inputs.iter().chain(&descriptor.outputs) {
            layout.allocation(name)?;
        }

        // Fallback resolves operands on every run instead of keeping a plan
        let plan = match backend {
            Backend::Fallback => {
                for kernel in &descriptor.kernels {
                    compile(&layout, kernel)?;
                }
                Vec::new()
            }
            Backend::Native | Backend::Threaded => descriptor
                .kernels
                .iter()
                .map(|kernel| {
                    let step = compile(&layout, kernel)?;
                    let scratch = vec![0.0; step.output.len()];
                    Ok((step, scratch))
                })
                .collect::<Result<Vec<_>>>()?,
        };

        let size_bytes = layout.total_size()?;
        let required_heap = (size_bytes / HEAP_GRANULE + 2) * HEAP_GRANULE;
        info!(
            backend = backend.as_str(),
            kernels = descriptor.kernels.len(),
            size_bytes,
            required_heap,
            "Graph loaded"
        );

        Ok(Self {
            backend,
            layout,
            kernels: descriptor.kernels,
            plan,
            data,
            inputs: descriptor.inputs,
            outputs: descriptor.outputs,
            required_heap,
        })
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Heap reservation for the data buffer, rounded up in 16 MiB granules
    /// with one spare granule
    pub fn required_heap(&self) -> usize {
        self.required_heap
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    /// Writable view of an input tensor
    pub fn input_mut(&mut self, name: &str) -> Result<&mut [f32]> {
        if !self.inputs.iter().any(|n| n == name) {
            return Err(Error::not_found(format!("input '{}'", name)));
        }
        let range = self.layout.allocation(name)?.elements();
        Ok(&mut self.data[range])
    }

    /// Read-only view of any allocation
    pub fn tensor(&self, name: &str) -> Result<&[f32]> {
        let range = self.layout.allocation(name)?.elements();
        Ok(&self.data[range])
    }

    /// Run every kernel once
    pub fn run(&mut self) -> Result<()> {
        match self.backend {
            Backend::Fallback => {
                for kernel in &self.kernels {
                    let step = compile(&self.layout, kernel)?;
                    let mut scratch = vec![0.0; step.output.len()];
                    execute_indexed(&step, &self.data, &mut scratch);
                    self.data[step.output.clone()].copy_from_slice(&scratch);
                }
            }
            Backend::Native => {
                for (step, scratch) in &mut self.plan {
                    execute_sequential(step, &self.data, scratch);
                    self.data[step.output.clone()].copy_from_slice(scratch);
                }
            }
            Backend::Threaded => {
                for (step, scratch) in &mut self.plan {
                    execute_parallel(step, &self.data, scratch);
                    self.data[step.output.clone()].copy_from_slice(scratch);
                }
            }
        }
        debug!(backend = self.backend.as_str(), "Graph executed");
        Ok(())
    }
}

fn range_of(layout: &MemoryLayout, name: &str) -> Result<Range<usize>> {
    Ok(layout.allocation(name)?.elements())
}

fn mismatch(kernel: &Kernel, message: String) -> Error {
    Error::setup(ENGINE, format!("{} kernel: {}", kernel.name(), message))
}

fn compile(layout: &MemoryLayout, kernel: &Kernel) -> Result<Step> {
    let step = match kernel {
        Kernel::Linear {
            x,
            w,
            y,
            in_features,
        } => {
            let (x, w, y) = (range_of(layout, x)?, range_of(layout, w)?, range_of(layout, y)?);
            let in_features = in_features.unwrap_or(x.len());
            if in_features == 0 || x.len() % in_features != 0 {
                return Err(mismatch(
                    kernel,
                    format!("input of {} elements is not a multiple of {}", x.len(), in_features),
                ));
            }
            let batch = x.len() / in_features;
            if batch == 0 || y.len() % batch != 0 {
                return Err(mismatch(kernel, format!("output of {} elements for batch {}", y.len(), batch)));
            }
            let out_features = y.len() / batch;
            if w.len() != in_features * out_features {
                return Err(mismatch(
                    kernel,
                    format!(
                        "weights have {} elements, expected {} x {}",
                        w.len(),
                        out_features,
                        in_features
                    ),
                ));
            }
            Step {
                op: Op::Linear { in_features },
                inputs: vec![x, w],
                output: y,
            }
        }
        Kernel::Bias { x, b, y }
        | Kernel::ElementwiseSum { x0: x, x1: b, y }
        | Kernel::ElementwiseMul { x0: x, x1: b, y } => {
            let (x, b, y) = (range_of(layout, x)?, range_of(layout, b)?, range_of(layout, y)?);
            let broadcast = matches!(kernel, Kernel::Bias { .. });
            let compatible = if broadcast {
                !b.is_empty() && y.len() % b.len() == 0
            } else {
                b.len() == y.len()
            };
            if x.len() != y.len() || !compatible {
                return Err(mismatch(
                    kernel,
                    format!("operands of {}, {} and {} elements", x.len(), b.len(), y.len()),
                ));
            }
            let op = match kernel {
                Kernel::ElementwiseMul { .. } => Op::Mul,
                _ => Op::Add,
            };
            Step {
                op,
                inputs: vec![x, b],
                output: y,
            }
        }
        Kernel::Concat {
            xs,
            y,
            axis,
            shapes,
        } => compile_concat(layout, kernel, xs, y, *axis, shapes)?,
        Kernel::Relu { x, y }
        | Kernel::Sigmoid { x, y }
        | Kernel::Tanh { x, y }
        | Kernel::Copy { x, y } => {
            let (x, y) = (range_of(layout, x)?, range_of(layout, y)?);
            if x.len() != y.len() {
                return Err(mismatch(kernel, format!("{} elements into {}", x.len(), y.len())));
            }
            let op = match kernel {
                Kernel::Relu { .. } => Op::Relu,
                Kernel::Sigmoid { .. } => Op::Sigmoid,
                Kernel::Tanh { .. } => Op::Tanh,
                _ => Op::Copy,
            };
            Step {
                op,
                inputs: vec![x],
                output: y,
            }
        }
    };
    Ok(step)
}

fn element_count(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
}

fn compile_concat(
    layout: &MemoryLayout,
    kernel: &Kernel,
    xs: &[String],
    y: &str,
    axis: usize,
    shapes: &[Vec<usize>],
) -> Result<Step> {
    let first = match shapes.first() {
        Some(first) if xs.len() == shapes.len() => first,
        _ => {
            return Err(mismatch(
                kernel,
                format!("{} inputs with {} shapes", xs.len(), shapes.len()),
            ))
        }
    };
    if axis >= first.len() {
        return Err(mismatch(
            kernel,
            format!("axis {} out of range for rank {}", axis, first.len()),
        ));
    }

    let mut inputs = Vec::with_capacity(xs.len());
    let mut segments = Vec::with_capacity(xs.len());
    for (name, shape) in xs.iter().zip(shapes) {
        let off_axis_agrees = shape.len() == first.len()
            && shape[..axis] == first[..axis]
            && shape[axis + 1..] == first[axis + 1..];
        if !off_axis_agrees || shape.contains(&0) {
            return Err(mismatch(
                kernel,
                format!("shape {:?} of '{}' cannot join {:?} on axis {}", shape, name, first, axis),
            ));
        }
        let range = range_of(layout, name)?;
        if element_count(shape) != Some(range.len()) {
            return Err(mismatch(
                kernel,
                format!("'{}' holds {} elements, shape {:?}", name, range.len(), shape),
            ));
        }
        segments.push(shape[axis..].iter().product());
        inputs.push(range);
    }

    let output = range_of(layout, y)?;
    let total: usize = inputs.iter().map(|r| r.len()).sum();
    if output.len() != total {
        return Err(mismatch(
            kernel,
            format!("output of {} elements, inputs hold {}", output.len(), total),
        ));
    }
    Ok(Step {
        op: Op::Concat { segments },
        inputs,
        output,
    })
}

fn binary(op: &Op, a: f32, b: f32) -> f32 {
    match op {
        Op::Mul => a * b,
        _ => a + b,
    }
}

/// Copy one output row of a concat from every input
fn concat_row(
    row: usize,
    y_row: &mut [f32],
    data: &[f32],
    inputs: &[Range<usize>],
    segments: &[usize],
) {
    let mut at = 0;
    for (input, &len) in inputs.iter().zip(segments) {
        let x = &data[input.clone()];
        y_row[at..at + len].copy_from_slice(&x[row * len..(row + 1) * len]);
        at += len;
    }
}

fn unary(op: &Op, v: f32) -> f32 {
    match op {
        Op::Relu => v.max(0.0),
        Op::Sigmoid => 1.0 / (1.0 + (-v).exp()),
        Op::Tanh => v.tanh(),
        _ => v,
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn execute_sequential(step: &Step, data: &[f32], out: &mut [f32]) {
    match &step.op {
        &Op::Linear { in_features } => {
            let (x, w) = (&data[step.inputs[0].clone()], &data[step.inputs[1].clone()]);
            let out_features = w.len() / in_features;
            for (x_row, y_row) in x
                .chunks_exact(in_features)
                .zip(out.chunks_exact_mut(out_features))
            {
                for (y, w_row) in y_row.iter_mut().zip(w.chunks_exact(in_features)) {
                    *y = dot(x_row, w_row);
                }
            }
        }
        Op::Add | Op::Mul => {
            let (a, b) = (&data[step.inputs[0].clone()], &data[step.inputs[1].clone()]);
            for (y, (&x, &other)) in out.iter_mut().zip(a.iter().zip(b.iter().cycle())) {
                *y = binary(&step.op, x, other);
            }
        }
        Op::Concat { segments } => {
            let width: usize = segments.iter().sum();
            for (row, y_row) in out.chunks_exact_mut(width).enumerate() {
                concat_row(row, y_row, data, &step.inputs, segments);
            }
        }
        op => {
            let x = &data[step.inputs[0].clone()];
            for (y, &v) in out.iter_mut().zip(x) {
                *y = unary(op, v);
            }
        }
    }
}

fn execute_parallel(step: &Step, data: &[f32], out: &mut [f32]) {
    match &step.op {
        &Op::Linear { in_features } => {
            let (x, w) = (&data[step.inputs[0].clone()], &data[step.inputs[1].clone()]);
            let out_features = w.len() / in_features;
            out.par_chunks_mut(out_features)
                .zip(x.par_chunks(in_features))
                .for_each(|(y_row, x_row)| {
                    y_row
                        .par_iter_mut()
                        .zip(w.par_chunks(in_features))
                        .for_each(|(y, w_row)| *y = dot(x_row, w_row));
                });
        }
        Op::Add | Op::Mul => {
            let (a, b) = (&data[step.inputs[0].clone()], &data[step.inputs[1].clone()]);
            out.par_iter_mut()
                .enumerate()
                .for_each(|(i, y)| *y = binary(&step.op, a[i], b[i % b.len()]));
        }
        Op::Concat { segments } => {
            let width: usize = segments.iter().sum();
            out.par_chunks_mut(width)
                .enumerate()
                .for_each(|(row, y_row)| concat_row(row, y_row, data, &step.inputs, segments));
        }
        op => {
            let x = &data[step.inputs[0].clone()];
            out.par_iter_mut()
                .zip(x.par_iter())
                .for_each(|(y, &v)| *y = unary(op, v));
        }
    }
}

#[allow(clippy::needless_range_loop)]
fn execute_indexed(step: &Step, data: &[f32], out: &mut [f32]) {
    match &step.op {
        &Op::Linear { in_features } => {
            let (x, w) = (step.inputs[0].start, step.inputs[1].start);
            let batch = step.inputs[0].len() / in_features;
            let out_features = out.len() / batch;
            for n in 0..batch {
                for o in 0..out_features {
                    let mut sum = 0.0;
                    for i in 0..in_features {
                        sum += data[x + n * in_features + i] * data[w + o * in_features + i];
                    }
                    out[n * out_features + o] = sum;
                }
            }
        }
        Op::Add | Op::Mul => {
            let (a, b) = (&step.inputs[0], &step.inputs[1]);
            for i in 0..out.len() {
                out[i] = binary(&step.op, data[a.start + i], data[b.start + i % b.len()]);
            }
        }
        Op::Concat { segments } => {
            let width: usize = segments.iter().sum();
            for row in 0..out.len() / width {
                let mut at = row * width;
                for (input, &len) in step.inputs.iter().zip(segments) {
                    for i in 0..len {
                        out[at + i] = data[input.start + row * len + i];
                    }
                    at += len;
                }
            }
        }
        op => {
            let x = step.inputs[0].start;
            for i in 0..out.len() {
                out[i] = unary(op, data[x + i]);
            }
        }
    }
}
