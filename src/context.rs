//! Encoder output handed to the decoder.
//!
//! A [`ContextSequence`] is produced once per utterance and shared read-only
//! by every decode step (and by both directions of the bidirectional pass).

use candle_core::{DType, Device, Tensor};

use crate::{Error, Result};

/// Encoder context `[1, T_in, D]` plus a per-position validity mask.
#[derive(Debug, Clone)]
pub struct ContextSequence {
    values: Tensor,
    mask: Tensor,
    valid: Vec<bool>,
}

impl ContextSequence {
    /// Wrap encoder outputs.
    ///
    /// - `values`: `[T_in, D]` or `[1, T_in, D]`
    /// - `valid`: one flag per input position, `true` = real token
    ///
    /// Fails with [`Error::EmptyContext`] if no position is valid.
    pub fn new(values: &Tensor, valid: &[bool]) -> Result<Self> {
        let values = match values.rank() {
            2 => values.unsqueeze(0)?,
            3 if values.dim(0)? == 1 => values.clone(),
            _ => {
                return Err(Error::Input(format!(
                    "context must be [T_in, D] or [1, T_in, D], got {:?}",
                    values.dims()
                )));
            }
        };
        let t_in = values.dim(1)?;
        if valid.len() != t_in {
            return Err(Error::Input(format!(
                "mask length {} does not match context length {t_in}",
                valid.len()
            )));
        }
        if !valid.iter().any(|&v| v) {
            return Err(Error::EmptyContext);
        }

        let mask_vals: Vec<f32> = valid.iter().map(|&v| if v { 1.0 } else { 0.0 }).collect();
        let mask = Tensor::from_vec(mask_vals, (1, t_in), values.device())?.to_dtype(values.dtype())?;

        Ok(Self {
            values: values.contiguous()?,
            mask,
            valid: valid.to_vec(),
        })
    }

    /// Wrap encoder outputs whose first `valid_len` positions are real tokens.
    pub fn with_length(values: &Tensor, valid_len: usize) -> Result<Self> {
        let t_in = match values.rank() {
            2 => values.dim(0)?,
            _ => values.dim(1)?,
        };
        let valid: Vec<bool> = (0..t_in).map(|i| i < valid_len).collect();
        Self::new(values, &valid)
    }

    /// `[1, T_in, D]` context values.
    pub fn values(&self) -> &Tensor {
        &self.values
    }

    /// `[1, T_in]` mask, 1.0 on valid positions and 0.0 on padding.
    pub fn mask(&self) -> &Tensor {
        &self.mask
    }

    /// Validity flag per position.
    pub fn valid(&self) -> &[bool] {
        &self.valid
    }

    pub fn len(&self) -> usize {
        self.valid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.valid.is_empty()
    }

    /// Number of unpadded positions.
    pub fn valid_len(&self) -> usize {
        self.valid.iter().filter(|&&v| v).count()
    }

    /// Index of the first valid position.
    pub fn first_valid(&self) -> usize {
        self.valid.iter().position(|&v| v).unwrap_or(0)
    }

    pub fn width(&self) -> usize {
        self.values.dims()[2]
    }

    pub fn device(&self) -> &Device {
        self.values.device()
    }

    pub fn dtype(&self) -> DType {
        self.values.dtype()
    }

    /// Append utterance-constant conditioning vectors to every position.
    ///
    /// Each vector is `[C]` or `[1, C]`; they are concatenated in order after
    /// the encoder channels.
    pub fn concat_conditioning(&self, vectors: &[&Tensor]) -> Result<Self> {
        if vectors.is_empty() {
            return Ok(self.clone());
        }
        let t_in = self.len();
        let mut parts = Vec::with_capacity(vectors.len() + 1);
        parts.push(self.values.clone());
        for v in vectors {
            let v = match v.rank() {
                1 => v.unsqueeze(0)?,
                2 if v.dim(0)? == 1 => (*v).clone(),
                _ => {
                    return Err(Error::Input(format!(
                        "conditioning vector must be [C] or [1, C], got {:?}",
                        v.dims()
                    )));
                }
            };
            let width = v.dim(1)?;
            let v = v
                .to_dtype(self.dtype())?
                .unsqueeze(1)?
                .broadcast_as((1, t_in, width))?;
            parts.push(v);
        }
        let values = Tensor::cat(&parts, 2)?.contiguous()?;
        Ok(Self {
            values,
            mask: self.mask.clone(),
            valid: self.valid.clone(),
        })
    }
}
