//! Additive content + location scoring.
//!
//! `e_i = v · tanh(W_q q + W_in x_i + W_loc f_i)`, where `f_i` are
//! convolutional features of the previous and cumulative alignments.

use std::ops::Range;

use candle_core::{Module, Tensor};
use candle_nn::{Conv1d, Conv1dConfig, Linear, VarBuilder};

use crate::Result;
use crate::config::AttentionConfig;

/// Convolution over `[alignment, cumulative]` followed by a dense projection.
#[derive(Debug, Clone)]
pub struct LocationLayer {
    conv: Conv1d,
    dense: Linear,
    kernel_size: usize,
}

impl LocationLayer {
    pub fn new(cfg: &AttentionConfig, vb: VarBuilder) -> Result<Self> {
        let conv_cfg = Conv1dConfig {
            padding: cfg.location_kernel_size / 2,
            ..Default::default()
        };
        let conv = candle_nn::conv1d_no_bias(
            2,
            cfg.location_filters,
            cfg.location_kernel_size,
            conv_cfg,
            vb.pp("location_conv"),
        )?;
        let dense = candle_nn::linear_no_bias(
            cfg.location_filters,
            cfg.attention_dim,
            vb.pp("location_dense"),
        )?;
        Ok(Self {
            conv,
            dense,
            kernel_size: cfg.location_kernel_size,
        })
    }

    /// Location features for positions in `range`: `[1, range.len(), A]`.
    ///
    /// The convolution only runs over `range` plus a halo of `kernel / 2` on
    /// each side, so results match the full-length convolution exactly.
    pub fn forward(
        &self,
        alignment: &Tensor,
        cumulative: &Tensor,
        range: &Range<usize>,
    ) -> Result<Tensor> {
        let len = alignment.dim(1)?;
        let halo = self.kernel_size / 2;
        let lo = range.start.saturating_sub(halo);
        let hi = (range.end + halo).min(len);

        // [1, 2, T] restricted to the haloed slice
        let x = Tensor::cat(&[alignment, cumulative], 0)?
            .unsqueeze(0)?
            .narrow(2, lo, hi - lo)?
            .contiguous()?;
        let y = self.conv.forward(&x)?; // [1, F, hi - lo]
        let y = y
            .narrow(2, range.start - lo, range.len())?
            .transpose(1, 2)?
            .contiguous()?;
        Ok(self.dense.forward(&y)?)
    }
}

/// Query/input projections and the energy vector `v`.
#[derive(Debug, Clone)]
pub struct AdditiveScorer {
    query_layer: Linear,
    inputs_layer: Linear,
    v: Linear,
    location: Option<LocationLayer>,
}

impl AdditiveScorer {
    pub fn new(
        cfg: &AttentionConfig,
        query_dim: usize,
        context_dim: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let query_layer =
            candle_nn::linear_no_bias(query_dim, cfg.attention_dim, vb.pp("query_layer"))?;
        let inputs_layer =
            candle_nn::linear_no_bias(context_dim, cfg.attention_dim, vb.pp("inputs_layer"))?;
        let v = candle_nn::linear(cfg.attention_dim, 1, vb.pp("v"))?;
        let location = if cfg.location_features {
            Some(LocationLayer::new(cfg, vb.pp("location_layer"))?)
        } else {
            None
        };
        Ok(Self {
            query_layer,
            inputs_layer,
            v,
            location,
        })
    }

    /// Project the context once per utterance: `[1, T_in, D] -> [1, T_in, A]`.
    pub fn process_inputs(&self, values: &Tensor) -> Result<Tensor> {
        Ok(self.inputs_layer.forward(values)?)
    }

    /// Raw energies `[1, range.len()]` for positions in `range`.
    pub fn energies(
        &self,
        query: &Tensor,
        processed_inputs: &Tensor,
        alignment: &Tensor,
        cumulative: &Tensor,
        range: &Range<usize>,
    ) -> Result<Tensor> {
        let pq = self.query_layer.forward(query)?.unsqueeze(1)?; // [1, 1, A]
        let mut hidden = processed_inputs
            .narrow(1, range.start, range.len())?
            .broadcast_add(&pq)?;
        if let Some(location) = &self.location {
            let pl = location.forward(alignment, cumulative, range)?;
            hidden = hidden.add(&pl)?;
        }
        let e = self.v.forward(&hidden.tanh()?)?; // [1, N, 1]
        Ok(e.squeeze(2)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, IndexOp};
    use candle_nn::VarMap;

    #[test]
    fn windowed_location_features_match_full_length() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let cfg = AttentionConfig {
            location_kernel_size: 5,
            location_filters: 4,
            attention_dim: 6,
            ..Default::default()
        };
        let layer = LocationLayer::new(&cfg, vb).unwrap();

        let alignment = Tensor::rand(0f32, 1.0, (1, 12), &dev).unwrap();
        let cumulative = Tensor::rand(0f32, 3.0, (1, 12), &dev).unwrap();
        let full = layer.forward(&alignment, &cumulative, &(0..12)).unwrap();
        for range in [0..3, 4..9, 9..12] {
            let part = layer.forward(&alignment, &cumulative, &range).unwrap();
            let expected = full.i((.., range.clone(), ..)).unwrap();
            let diff: f32 = (part - expected)
                .unwrap()
                .abs()
                .unwrap()
                .max_all()
                .unwrap()
                .to_scalar()
                .unwrap();
            assert!(diff < 1e-5, "range {range:?} differs by {diff}");
        }
    }
}
