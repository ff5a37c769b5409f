//! Tensor primitives for the generator, on HWC feature maps.
//!
//! Convolutions use "same" padding and lower to a single matrix multiply
//! (im2col for the strided convolution, col2im for the transposed one).

use ndarray::{concatenate, s, Array1, Array2, Array3, Axis};
use rand::{Rng, RngCore};

use crate::error::{Error, Result};

/// Feature map in HWC format (height, width, channels).
pub type FeatureMap = Array3<f32>;

/// Padding applied before the first row/column for TensorFlow-style "same" padding.
const fn same_padding_before(input: usize, output: usize, kernel: usize, stride: usize) -> usize {
    let needed = (output - 1) * stride + kernel;
    needed.saturating_sub(input) / 2
}

/// Map an output/input coordinate to its partner, or `None` when it falls in the padding.
#[inline]
fn shifted(base: usize, offset: usize, padding: usize, limit: usize) -> Option<usize> {
    (base + offset)
        .checked_sub(padding)
        .filter(|&index| index < limit)
}

/// Strided convolution with "same" padding.
///
/// `weights` has shape `(kernel * kernel * in_channels, out_channels)`, i.e. a
/// `(kh, kw, in, out)` kernel flattened row-major.
///
/// # Errors
///
/// Returns [`Error::ShapeMismatch`] if the weights do not fit the input channels.
pub fn conv2d(
    input: &FeatureMap,
    weights: &Array2<f32>,
    kernel: usize,
    stride: usize,
) -> Result<FeatureMap> {
    let (height, width, channels) = input.dim();
    let (rows, out_channels) = weights.dim();

    if rows != kernel * kernel * channels {
        return Err(Error::ShapeMismatch {
            expected: format!("{} weight rows", kernel * kernel * channels),
            actual: format!("{rows} weight rows"),
        });
    }

    let out_height = height.div_ceil(stride);
    let out_width = width.div_ceil(stride);
    let pad_top = same_padding_before(height, out_height, kernel, stride);
    let pad_left = same_padding_before(width, out_width, kernel, stride);

    let mut patches = Array2::<f32>::zeros((out_height * out_width, rows));

    for oy in 0..out_height {
        for ox in 0..out_width {
            let mut patch = patches.row_mut(oy * out_width + ox);
            for ky in 0..kernel {
                let Some(iy) = shifted(oy * stride, ky, pad_top, height) else {
                    continue;
                };
                for kx in 0..kernel {
                    let Some(ix) = shifted(ox * stride, kx, pad_left, width) else {
                        continue;
                    };
                    let base = (ky * kernel + kx) * channels;
                    patch
                        .slice_mut(s![base..base + channels])
                        .assign(&input.slice(s![iy, ix, ..]));
                }
            }
        }
    }

    let output = patches.dot(weights);
    Ok(output.into_shape_with_order((out_height, out_width, out_channels))?)
}

/// Strided transposed convolution with "same" padding; doubles resolution for stride 2.
///
/// `weights` has shape `(in_channels, kernel * kernel * out_channels)`, i.e. a
/// `(kh, kw, out, in)` kernel with the input axis moved to the front.
///
/// # Errors
///
/// Returns [`Error::ShapeMismatch`] if the weights do not fit the input channels.
pub fn conv_transpose2d(
    input: &FeatureMap,
    weights: &Array2<f32>,
    kernel: usize,
    stride: usize,
) -> Result<FeatureMap> {
    let (height, width, channels) = input.dim();
    let (rows, cols) = weights.dim();

    if rows != channels || cols % (kernel * kernel) != 0 {
        return Err(Error::ShapeMismatch {
            expected: format!("({channels}, k*k*out) weights"),
            actual: format!("({rows}, {cols}) weights"),
        });
    }

    let out_channels = cols / (kernel * kernel);
    let out_height = height * stride;
    let out_width = width * stride;
    let pad_top = same_padding_before(out_height, height, kernel, stride);
    let pad_left = same_padding_before(out_width, width, kernel, stride);

    let flat = input.to_shape((height * width, channels))?;
    let columns = flat.dot(weights);

    let mut output = Array3::<f32>::zeros((out_height, out_width, out_channels));

    for iy in 0..height {
        for ix in 0..width {
            let column = columns.row(iy * width + ix);
            for ky in 0..kernel {
                let Some(oy) = shifted(iy * stride, ky, pad_top, out_height) else {
                    continue;
                };
                for kx in 0..kernel {
                    let Some(ox) = shifted(ix * stride, kx, pad_left, out_width) else {
                        continue;
                    };
                    let base = (ky * kernel + kx) * out_channels;
                    let mut target = output.slice_mut(s![oy, ox, ..]);
                    target += &column.slice(s![base..base + out_channels]);
                }
            }
        }
    }

    Ok(output)
}

/// Apply a per-channel affine transform `x * scale + shift` in place.
pub fn affine_channels(x: &mut FeatureMap, scale: &Array1<f32>, shift: &Array1<f32>) {
    for mut pixel in x.lanes_mut(Axis(2)) {
        pixel.zip_mut_with(scale, |v, &a| *v *= a);
        pixel += shift;
    }
}

/// Normalize with the statistics of the feature map itself (training-mode batch norm).
#[allow(clippy::cast_precision_loss)]
pub fn normalize_with_batch_statistics(
    x: &mut FeatureMap,
    gamma: &Array1<f32>,
    beta: &Array1<f32>,
    epsilon: f32,
) {
    let (height, width, _) = x.dim();
    let count = (height * width) as f32;

    let mean = x.sum_axis(Axis(0)).sum_axis(Axis(0)) / count;
    let variance = (&*x - &mean)
        .mapv(|v| v * v)
        .sum_axis(Axis(0))
        .sum_axis(Axis(0))
        / count;

    let scale = gamma / &variance.mapv(|v| (v + epsilon).sqrt());
    let shift = beta - &(&mean * &scale);

    affine_channels(x, &scale, &shift);
}

/// Leaky rectifier: `x` for positive inputs, `slope * x` otherwise.
pub fn leaky_relu(x: &mut FeatureMap, slope: f32) {
    x.mapv_inplace(|v| if v > 0.0 { v } else { v * slope });
}

/// Rectifier.
pub fn relu(x: &mut FeatureMap) {
    x.mapv_inplace(|v| v.max(0.0));
}

/// Hyperbolic tangent, bounding values to [-1, 1].
pub fn tanh(x: &mut FeatureMap) {
    x.mapv_inplace(f32::tanh);
}

/// Inverted dropout: zero each unit with probability `rate`, rescale survivors.
pub fn dropout(x: &mut FeatureMap, rate: f32, rng: &mut dyn RngCore) {
    let keep = 1.0 - rate;
    x.mapv_inplace(|v| if rng.random::<f32>() < rate { 0.0 } else { v / keep });
}

/// Concatenate two feature maps along the channel axis, `first` channels first.
///
/// # Errors
///
/// Returns [`Error::Architecture`] if the spatial dimensions differ.
pub fn concat_channels(first: &FeatureMap, second: &FeatureMap) -> Result<FeatureMap> {
    let (h1, w1, _) = first.dim();
    let (h2, w2, _) = second.dim();

    if (h1, w1) != (h2, w2) {
        return Err(Error::Architecture {
            reason: format!("cannot concatenate {h1}x{w1} features with {h2}x{w2} skip features"),
        });
    }

    Ok(concatenate(Axis(2), &[first.view(), second.view()])?)
}
