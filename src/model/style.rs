//! Global style tokens.
//!
//! A reference spectrogram is summarized by a strided conv stack + GRU into a
//! query, which attends over a bank of learned tokens (multi-head, scaled
//! dot-product). Callers can instead pass explicit per-token weights.

use std::collections::BTreeMap;

use candle_core::{D, IndexOp, Module, ModuleT, Tensor};
use candle_nn::rnn::{GRU, GRUConfig, RNN};
use candle_nn::{BatchNorm, Conv2d, Conv2dConfig, Init, Linear, VarBuilder};

use crate::config::StyleConfig;
use crate::{Error, Result};

/// How a style vector is requested.
#[derive(Debug, Clone)]
pub enum StyleInput {
    /// Reference spectrogram `[T_ref, num_mel]`.
    Reference(Tensor),
    /// Explicit weight per token index. Indices outside the bank are ignored.
    Weights(BTreeMap<usize, f32>),
}

/// Conv2d stack followed by a GRU; emits the final hidden state.
#[derive(Debug, Clone)]
pub struct ReferenceEncoder {
    convs: Vec<(Conv2d, BatchNorm)>,
    gru: GRU,
    num_mel: usize,
}

impl ReferenceEncoder {
    pub fn new(cfg: &StyleConfig, vb: VarBuilder) -> Result<Self> {
        let conv_cfg = Conv2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };
        let mut convs = Vec::with_capacity(cfg.reference_filters.len());
        let mut in_ch = 1;
        let mut height = cfg.num_mel;
        for (i, &out_ch) in cfg.reference_filters.iter().enumerate() {
            let conv = candle_nn::conv2d(in_ch, out_ch, 3, conv_cfg, vb.pp(format!("convs.{i}")))?;
            let bn = candle_nn::batch_norm(out_ch, 1e-5, vb.pp(format!("bns.{i}")))?;
            convs.push((conv, bn));
            in_ch = out_ch;
            height = (height + 2 - 3) / 2 + 1;
        }
        let gru = candle_nn::gru(
            in_ch * height,
            cfg.embedding_dim / 2,
            GRUConfig::default(),
            vb.pp("recurrence"),
        )?;
        Ok(Self {
            convs,
            gru,
            num_mel: cfg.num_mel,
        })
    }

    /// `[T_ref, num_mel]` (or `[1, T_ref, num_mel]`) -> `[1, embedding_dim / 2]`.
    pub fn forward(&self, mel: &Tensor) -> Result<Tensor> {
        let mel = if mel.rank() == 3 { mel.squeeze(0)? } else { mel.clone() };
        let (t_ref, n_mel) = mel.dims2()?;
        if n_mel != self.num_mel || t_ref == 0 {
            return Err(Error::Input(format!(
                "reference spectrogram must be [T_ref > 0, {}], got {:?}",
                self.num_mel,
                mel.dims()
            )));
        }
        let mut x = mel.reshape((1, 1, t_ref, n_mel))?;
        for (conv, bn) in &self.convs {
            x = conv.forward(&x)?;
            x = bn.forward_t(&x, false)?;
            x = x.relu()?;
        }
        // [1, C, T', H'] -> [1, T', C * H']
        let (_, c, t, h) = x.dims4()?;
        let x = x.transpose(1, 2)?.contiguous()?.reshape((1, t, c * h))?;
        let states = self.gru.seq(&x)?;
        let last = states
            .last()
            .ok_or_else(|| Error::Input("reference spectrogram too short".into()))?;
        Ok(last.h().clone())
    }
}

/// Learned token bank with multi-head attention from a reference query.
#[derive(Debug, Clone)]
pub struct StyleTokenBank {
    /// `[K, D]` raw tokens; `tanh` is applied on use.
    tokens: Tensor,
    w_query: Linear,
    w_key: Linear,
    num_heads: usize,
}

impl StyleTokenBank {
    pub fn new(cfg: &StyleConfig, vb: VarBuilder) -> Result<Self> {
        let d = cfg.embedding_dim;
        let tokens = vb.get_with_hints(
            (cfg.num_tokens, d),
            "style_tokens",
            Init::Randn {
                mean: 0.0,
                stdev: 0.5,
            },
        )?;
        let w_query = candle_nn::linear_no_bias(d / 2, d, vb.pp("attention.W_query"))?;
        let w_key = candle_nn::linear_no_bias(d, d, vb.pp("attention.W_key"))?;
        Ok(Self {
            tokens,
            w_query,
            w_key,
            num_heads: cfg.num_heads,
        })
    }

    pub fn num_tokens(&self) -> usize {
        self.tokens.dims()[0]
    }

    pub fn dim(&self) -> usize {
        self.tokens.dims()[1]
    }

    /// Per-head softmax weights over tokens, `[H, 1, K]`.
    fn head_weights(&self, query: &Tensor, values: &Tensor) -> Result<Tensor> {
        let (k, d) = self.tokens.dims2()?;
        let h = self.num_heads;
        let dh = d / h;
        let q = self.w_query.forward(query)?.reshape((h, 1, dh))?;
        let keys = self
            .w_key
            .forward(values)?
            .reshape((k, h, dh))?
            .transpose(0, 1)?
            .contiguous()?; // [H, K, dh]
        let scores = (q.matmul(&keys.t()?)? / (dh as f64).sqrt())?;
        Ok(candle_nn::ops::softmax(&scores, D::Minus1)?)
    }

    /// Attend from a reference query `[1, D / 2]`; returns `[1, D]`.
    pub fn attend(&self, query: &Tensor) -> Result<Tensor> {
        let (k, d) = self.tokens.dims2()?;
        let h = self.num_heads;
        let values = self.tokens.tanh()?;
        let weights = self.head_weights(query, &values)?;
        let values = values.reshape((k, h, d / h))?.transpose(0, 1)?.contiguous()?;
        let out = weights.matmul(&values)?; // [H, 1, dh]
        Ok(out.transpose(0, 1)?.contiguous()?.reshape((1, d))?)
    }

    /// `Σ w_k · tanh(token_k)` over the given indices; `[1, D]`.
    pub fn weighted(&self, weights: &BTreeMap<usize, f32>) -> Result<Tensor> {
        let values = self.tokens.tanh()?;
        let mut acc = Tensor::zeros(self.dim(), self.tokens.dtype(), self.tokens.device())?;
        for (&idx, &w) in weights {
            if idx >= self.num_tokens() {
                tracing::warn!(idx, num_tokens = self.num_tokens(), "ignoring out-of-range style token");
                continue;
            }
            let row = values.i(idx)?;
            acc = acc.add(&(row * f64::from(w))?)?;
        }
        Ok(acc.unsqueeze(0)?)
    }
}

/// Reference encoder + token bank.
#[derive(Debug, Clone)]
pub struct StyleEncoder {
    reference: ReferenceEncoder,
    bank: StyleTokenBank,
}

impl StyleEncoder {
    pub fn new(cfg: &StyleConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            reference: ReferenceEncoder::new(cfg, vb.pp("encoder"))?,
            bank: StyleTokenBank::new(cfg, vb.pp("layer"))?,
        })
    }

    pub fn bank(&self) -> &StyleTokenBank {
        &self.bank
    }

    /// Style vector `[1, D]` for either input form.
    pub fn forward(&self, input: &StyleInput) -> Result<Tensor> {
        match input {
            StyleInput::Reference(mel) => {
                let query = self.reference.forward(mel)?;
                self.bank.attend(&query)
            }
            StyleInput::Weights(weights) => self.bank.weighted(weights),
        }
    }
}
