//! Tensor kernels over `[channels, height, width]` arrays.

use ndarray::{s, Array1, Array2, Array3, Array4, Axis, Zip};
use rayon::prelude::*;

/// Output length of a strided window over `input` elements
pub fn output_len(input: usize, kernel: usize, stride: usize, padding: usize) -> Option<usize> {
    if stride == 0 {
        return None;
    }
    (input + 2 * padding)
        .checked_sub(kernel)
        .map(|span| span / stride + 1)
}

/// Outputs of one kernel tap that land inside the input.
///
/// Returns `(first_output, count, first_input)` for tap `tap` or `None` when
/// every position falls into the padding.
fn tap_range(
    out_len: usize,
    in_len: usize,
    tap: usize,
    stride: usize,
    padding: usize,
) -> Option<(usize, usize, usize)> {
    if in_len + padding <= tap {
        return None;
    }
    let first = if padding > tap {
        (padding - tap + stride - 1) / stride
    } else {
        0
    };
    let end = ((in_len + padding - tap - 1) / stride + 1).min(out_len);
    if first >= end {
        return None;
    }
    Some((first, end - first, first * stride + tap - padding))
}

/// Direct convolution, weights `[out, in, k, k]`
pub fn conv2d(
    input: &Array3<f32>,
    weights: &Array4<f32>,
    stride: usize,
    padding: usize,
    parallel: bool,
) -> Array3<f32> {
    let (_, height, width) = input.dim();
    let (out_channels, _, kernel, _) = weights.dim();
    let out_h = output_len(height, kernel, stride, padding).unwrap_or(0);
    let out_w = output_len(width, kernel, stride, padding).unwrap_or(0);

    let plane = |o: usize| conv_plane(input, weights, o, (out_h, out_w), stride, padding);
    let planes: Vec<Array2<f32>> = if parallel {
        (0..out_channels).into_par_iter().map(plane).collect()
    } else {
        (0..out_channels).map(plane).collect()
    };

    let mut output = Array3::zeros((out_channels, out_h, out_w));
    for (mut dst, src) in output.axis_iter_mut(Axis(0)).zip(&planes) {
        dst.assign(src);
    }
    output
}

fn conv_plane(
    input: &Array3<f32>,
    weights: &Array4<f32>,
    o: usize,
    (out_h, out_w): (usize, usize),
    stride: usize,
    padding: usize,
) -> Array2<f32> {
    let (in_channels, height, width) = input.dim();
    let kernel = weights.dim().2;
    let step = stride as isize;
    let mut plane = Array2::zeros((out_h, out_w));

    for ky in 0..kernel {
        let Some((oy, ny, iy)) = tap_range(out_h, height, ky, stride, padding) else {
            continue;
        };
        for kx in 0..kernel {
            let Some((ox, nx, ix)) = tap_range(out_w, width, kx, stride, padding) else {
                continue;
            };
            let mut dst = plane.slice_mut(s![oy..oy + ny, ox..ox + nx]);
            for i in 0..in_channels {
                let src = input.slice(s![
                    i,
                    iy..iy + (ny - 1) * stride + 1;step,
                    ix..ix + (nx - 1) * stride + 1;step
                ]);
                dst.scaled_add(weights[[o, i, ky, kx]], &src);
            }
        }
    }
    plane
}

/// Per-channel `x * scale + shift`
pub fn batch_norm(input: &Array3<f32>, scale: &Array1<f32>, shift: &Array1<f32>) -> Array3<f32> {
    let mut output = input.clone();
    for ((mut channel, &s), &b) in output.axis_iter_mut(Axis(0)).zip(scale).zip(shift) {
        channel.mapv_inplace(|v| v * s + b);
    }
    output
}

pub fn relu(input: &Array3<f32>) -> Array3<f32> {
    input.mapv(|v| v.max(0.0))
}

pub fn add(lhs: &Array3<f32>, rhs: &Array3<f32>) -> Array3<f32> {
    lhs + rhs
}

/// Max pooling; padded positions never win
pub fn max_pool(input: &Array3<f32>, size: usize, stride: usize, padding: usize) -> Array3<f32> {
    let (channels, height, width) = input.dim();
    let out_h = output_len(height, size, stride, padding).unwrap_or(0);
    let out_w = output_len(width, size, stride, padding).unwrap_or(0);
    let step = stride as isize;
    let mut output = Array3::from_elem((channels, out_h, out_w), f32::NEG_INFINITY);

    for ky in 0..size {
        let Some((oy, ny, iy)) = tap_range(out_h, height, ky, stride, padding) else {
            continue;
        };
        for kx in 0..size {
            let Some((ox, nx, ix)) = tap_range(out_w, width, kx, stride, padding) else {
                continue;
            };
            let src = input.slice(s![
                ..,
                iy..iy + (ny - 1) * stride + 1;step,
                ix..ix + (nx - 1) * stride + 1;step
            ]);
            Zip::from(output.slice_mut(s![.., oy..oy + ny, ox..ox + nx]))
                .and(&src)
                .for_each(|o, &v| *o = o.max(v));
        }
    }
    output
}

/// Mean over each channel, as `[channels, 1, 1]`
pub fn global_avg_pool(input: &Array3<f32>) -> Array3<f32> {
    let channels = input.dim().0;
    Array3::from_shape_fn((channels, 1, 1), |(c, _, _)| {
        input.index_axis(Axis(0), c).mean().unwrap_or(0.0)
    })
}

/// Fully connected layer over the flattened input, weights `[out, in]`
pub fn dense(input: &Array3<f32>, weights: &Array2<f32>, bias: &Array1<f32>) -> Array3<f32> {
    let x: Array1<f32> = input.iter().copied().collect();
    let y = weights.dot(&x) + bias;
    Array3::from_shape_fn((y.len(), 1, 1), |(o, _, _)| y[o])
}
