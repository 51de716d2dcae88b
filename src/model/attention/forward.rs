//! Forward attention: monotonic path probabilities.
//!
//! Each step the previous path distribution `α` either stays put or moves one
//! position right, weighted by the transition probability `u`:
//!
//! `α'_i ∝ ((1 - u) α_i + u α_{i-1}) · content_i`

use candle_core::{Module, Tensor};
use candle_nn::{Linear, VarBuilder};

use super::mask;
use crate::{Error, Result};

/// Transition probability used when no transition agent is configured.
pub const FIXED_TRANSITION: f64 = 0.5;

/// Positions kept around the previous peak by the inference-time prune.
const PRUNE_BEHIND: usize = 1;
const PRUNE_AHEAD: usize = 2;

/// Path probabilities carried between steps.
#[derive(Debug, Clone)]
pub struct ForwardState {
    /// `[1, T_in]` path distribution.
    pub alpha: Tensor,
    /// `[1, 1]` probability of moving forward on the next step.
    pub transition: Tensor,
}

#[derive(Debug, Clone)]
pub struct ForwardAttention {
    agent: Option<Linear>,
    prune: bool,
}

impl ForwardAttention {
    /// Forward attention with a fixed transition probability.
    pub fn fixed(prune: bool) -> Self {
        Self { agent: None, prune }
    }

    /// Forward attention with a learned transition agent over `[context ‖ query]`.
    pub fn with_agent(
        context_dim: usize,
        query_dim: usize,
        prune: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let agent = candle_nn::linear(context_dim + query_dim, 1, vb.pp("ta"))?;
        Ok(Self {
            agent: Some(agent),
            prune,
        })
    }

    /// One-hot on `first_valid`, transition at its fixed value.
    pub fn init(&self, len: usize, first_valid: usize, like: &Tensor) -> Result<ForwardState> {
        let mut alpha = vec![0f32; len];
        alpha[first_valid] = 1.0;
        let alpha = Tensor::from_vec(alpha, (1, len), like.device())?.to_dtype(like.dtype())?;
        let transition = Tensor::full(FIXED_TRANSITION as f32, (1, 1), like.device())?
            .to_dtype(like.dtype())?;
        Ok(ForwardState { alpha, transition })
    }

    /// Combine the previous path with this step's content alignment.
    ///
    /// `content` and `valid` are `[1, T_in]`; `valid` is the context mask,
    /// narrowed to the scoring window when one is active. Falls back to the
    /// transition prior alone if the product has no mass.
    pub fn advance(
        &self,
        prior: &ForwardState,
        content: &Tensor,
        valid: &Tensor,
        prev_peak: Option<usize>,
    ) -> Result<Tensor> {
        let len = prior.alpha.dim(1)?;
        let shifted = if len > 1 {
            prior.alpha.narrow(1, 0, len - 1)?.pad_with_zeros(1, 1, 0)?
        } else {
            prior.alpha.zeros_like()?
        };
        let stay = prior.transition.affine(-1.0, 1.0)?;
        let path = prior
            .alpha
            .broadcast_mul(&stay)?
            .add(&shifted.broadcast_mul(&prior.transition)?)?;

        let mut support = valid.clone();
        if self.prune
            && let Some(peak) = prev_peak
        {
            let keep = peak.saturating_sub(PRUNE_BEHIND)..(peak + PRUNE_AHEAD + 1).min(len);
            support = support.mul(&mask::range_mask(&keep, len, &support)?)?;
        }
        let path = path.mul(&support)?;

        let alpha = path.mul(content)?;
        if mask::total_mass(&alpha)? > 0.0 {
            return mask::renormalize(&alpha);
        }
        tracing::debug!("forward attention product has no mass, using transition prior");
        if mask::total_mass(&path)? > 0.0 {
            return mask::renormalize(&path);
        }
        Err(Error::Alignment("forward attention lost all path mass".into()))
    }

    /// Transition probability for the next step, `[1, 1]`.
    pub fn next_transition(
        &self,
        prior: &ForwardState,
        context: &Tensor,
        query: &Tensor,
    ) -> Result<Tensor> {
        match &self.agent {
            Some(agent) => {
                let input = Tensor::cat(&[context, query], 1)?;
                Ok(candle_nn::ops::sigmoid(&agent.forward(&input)?)?)
            }
            None => Ok(prior.transition.clone()),
        }
    }
}
