//! Score masking and alignment normalization.
//!
//! Padded positions get the dtype's most negative value before softmax (never
//! `-inf`, so an all-masked row cannot turn into NaN) and are then zeroed
//! exactly by multiplying with the 0/1 mask.

use std::ops::Range;

use candle_core::{DType, Tensor};

use crate::config::Normalization;
use crate::{Error, Result};

/// Most negative finite value representable in `dtype`.
pub fn fill_value(dtype: DType) -> f64 {
    match dtype {
        DType::F32 => f64::from(f32::MIN),
        DType::F16 => f64::from(half::f16::MIN),
        DType::BF16 => f64::from(half::bf16::MIN),
        DType::F64 => f64::MIN,
        _ => f64::from(f32::MIN),
    }
}

/// Replace scores where `mask == 0` with [`fill_value`].
///
/// `scores` and `mask` share shape `[1, N]`.
pub fn masked_fill(scores: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let fill = fill_value(scores.dtype());
    // mask * scores + (1 - mask) * fill
    let keep = scores.mul(mask)?;
    let bias = mask.affine(-fill, fill)?;
    Ok(keep.add(&bias)?)
}

/// Turn raw energies `[1, N]` into a distribution over the unmasked positions.
///
/// Masked positions are exactly zero in the result. Fails with
/// [`Error::Alignment`] when the unmasked mass is zero or not finite.
pub fn normalize(energies: &Tensor, mask: &Tensor, mode: Normalization) -> Result<Tensor> {
    let weights = match mode {
        Normalization::Softmax => {
            let filled = masked_fill(energies, mask)?;
            candle_nn::ops::softmax_last_dim(&filled)?.mul(mask)?
        }
        Normalization::Sigmoid => candle_nn::ops::sigmoid(energies)?.mul(mask)?,
    };
    renormalize(&weights)
}

/// Divide `[1, N]` non-negative weights by their sum.
pub fn renormalize(weights: &Tensor) -> Result<Tensor> {
    let total = total_mass(weights)?;
    if !(total.is_finite() && total > 0.0) {
        return Err(Error::Alignment(format!(
            "alignment mass is {total} over {} positions",
            weights.elem_count()
        )));
    }
    Ok(weights.affine(1.0 / total, 0.0)?)
}

/// Sum of all entries as `f64`.
pub fn total_mass(weights: &Tensor) -> Result<f64> {
    Ok(weights
        .to_dtype(DType::F64)?
        .sum_all()?
        .to_scalar::<f64>()?)
}

/// Symmetric window `[peak - w, peak + w]` clamped to `[0, len)`.
pub fn window_range(peak: usize, half_width: usize, len: usize) -> Range<usize> {
    let lo = peak.saturating_sub(half_width);
    let hi = (peak + half_width + 1).min(len);
    lo..hi
}

/// Host-side `[1, len]` 0/1 mask that keeps only `range`.
pub fn range_mask(range: &Range<usize>, len: usize, like: &Tensor) -> Result<Tensor> {
    let vals: Vec<f32> = (0..len)
        .map(|i| if range.contains(&i) { 1.0 } else { 0.0 })
        .collect();
    Ok(Tensor::from_vec(vals, (1, len), like.device())?.to_dtype(like.dtype())?)
}
