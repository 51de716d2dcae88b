//! Stop-token predictor.

use candle_core::{Module, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::Result;

/// Linear projection of `[decoder hidden ‖ attention context]` to one logit.
#[derive(Debug, Clone)]
pub struct StopNet {
    linear: Linear,
    /// Read a detached copy of the input so the stop loss never reaches the decoder.
    separate: bool,
}

impl StopNet {
    pub fn new(in_dim: usize, separate: bool, vb: VarBuilder) -> Result<Self> {
        let linear = candle_nn::linear(in_dim, 1, vb.pp("linear"))?;
        Ok(Self { linear, separate })
    }

    /// `[1, in_dim] -> [1, 1]` stop logit.
    pub fn forward(&self, hidden_context: &Tensor) -> Result<Tensor> {
        let input = if self.separate {
            hidden_context.detach()
        } else {
            hidden_context.clone()
        };
        Ok(self.linear.forward(&input)?)
    }
}

/// Logistic of a stop logit.
pub fn stop_probability(logit: f32) -> f32 {
    1.0 / (1.0 + (-logit).exp())
}
