//! Postnet: convolutional residual refinement of decoded frames.

use candle_core::{Module, ModuleT, Tensor};
use candle_nn::{BatchNorm, Conv1d, Conv1dConfig, VarBuilder};

use crate::Result;
use crate::config::PostnetConfig;

#[derive(Debug, Clone)]
struct ConvBlock {
    conv: Conv1d,
    norm: BatchNorm,
    activation: bool,
}

impl ConvBlock {
    fn new(
        in_ch: usize,
        out_ch: usize,
        kernel: usize,
        activation: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let cfg = Conv1dConfig {
            padding: kernel / 2,
            ..Default::default()
        };
        let conv = candle_nn::conv1d_no_bias(in_ch, out_ch, kernel, cfg, vb.pp("conv1d"))?;
        let norm = candle_nn::batch_norm(out_ch, 1e-5, vb.pp("bn"))?;
        Ok(Self {
            conv,
            norm,
            activation,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.conv.forward(x)?;
        let x = self.norm.forward_t(&x, false)?;
        Ok(if self.activation { x.tanh()? } else { x })
    }
}

/// Stack of conv + batch-norm blocks, tanh on every block except the last.
///
/// [`Postnet::forward`] returns the residual; callers add it to the decoder
/// frames themselves.
#[derive(Debug, Clone)]
pub struct Postnet {
    blocks: Vec<ConvBlock>,
}

impl Postnet {
    pub fn new(cfg: &PostnetConfig, frame_dim: usize, vb: VarBuilder) -> Result<Self> {
        let n = cfg.num_convs;
        let mut blocks = Vec::with_capacity(n);
        for i in 0..n {
            let in_ch = if i == 0 { frame_dim } else { cfg.channels };
            let out_ch = if i + 1 == n { frame_dim } else { cfg.channels };
            blocks.push(ConvBlock::new(
                in_ch,
                out_ch,
                cfg.kernel_size,
                i + 1 < n,
                vb.pp(format!("convolutions.{i}")),
            )?);
        }
        Ok(Self { blocks })
    }

    /// Residual for `frames` (`[T_out, frame_dim]`), same shape.
    pub fn forward(&self, frames: &Tensor) -> Result<Tensor> {
        let mut x = frames.t()?.unsqueeze(0)?.contiguous()?; // [1, F, T]
        for block in &self.blocks {
            x = block.forward(&x)?;
        }
        Ok(x.squeeze(0)?.t()?.contiguous()?)
    }

    /// `frames + residual`.
    pub fn refine(&self, frames: &Tensor) -> Result<Tensor> {
        Ok(frames.add(&self.forward(frames)?)?)
    }
}
