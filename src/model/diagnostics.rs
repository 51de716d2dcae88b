//! Alignment health metrics and time-reversal helpers.

use candle_core::{DType, Tensor};

use crate::Result;

/// Mean over steps of the maximum alignment weight, for `[steps, T_in]`.
///
/// Close to 1.0 for a sharp, confident alignment; close to `1 / T_in` for a
/// diffuse one.
pub fn alignment_diagonality(alignments: &Tensor) -> Result<f32> {
    let peaks = alignments.to_dtype(DType::F32)?.max(1)?;
    Ok(peaks.mean_all()?.to_scalar::<f32>()?)
}

/// Argmax input position per step, for `[steps, T_in]`.
pub fn alignment_peaks(alignments: &Tensor) -> Result<Vec<usize>> {
    let idx: Vec<u32> = alignments.argmax(1)?.to_vec1()?;
    Ok(idx.into_iter().map(|i| i as usize).collect())
}

/// Mean absolute difference between two same-shaped tensors.
pub fn l1_distance(a: &Tensor, b: &Tensor) -> Result<f32> {
    let diff = a.to_dtype(DType::F32)?.sub(&b.to_dtype(DType::F32)?)?;
    Ok(diff.abs()?.mean_all()?.to_scalar::<f32>()?)
}

/// Reverse `x` along dimension 0.
pub fn reverse_time(x: &Tensor) -> Result<Tensor> {
    let n = x.dim(0)?;
    let idx: Vec<u32> = (0..n as u32).rev().collect();
    let idx = Tensor::from_vec(idx, n, x.device())?;
    Ok(x.index_select(&idx, 0)?)
}
