//! Step-wise attention over the encoder context.
//!
//! Four alignment policies share one interface, [`Attention::compute`]:
//!
//! | policy | alignment |
//! |---|---|
//! | location-sensitive | normalized additive energies |
//! | forward | content alignment × monotonic path prior (`u = 0.5`) |
//! | forward + transition agent | as above, `u` predicted each step |
//! | windowed | any of the above, scored only near the previous peak |
//!
//! The policy is resolved once at construction. All per-utterance state lives
//! in [`AttentionState`], which callers thread through each step.

pub mod forward;
pub mod location;
pub mod mask;

use std::ops::Range;

use candle_core::{DType, Tensor};
use candle_nn::VarBuilder;

use crate::config::{AttentionConfig, AttentionPolicy, Normalization};
use crate::context::ContextSequence;
use crate::{Error, Result};

use self::forward::{ForwardAttention, ForwardState};
use self::location::AdditiveScorer;

#[derive(Debug, Clone)]
enum Policy {
    LocationSensitive,
    Forward(ForwardAttention),
    Windowed { inner: Box<Policy>, half_width: usize },
}

impl Policy {
    fn forward(&self) -> Option<&ForwardAttention> {
        match self {
            Policy::Forward(f) => Some(f),
            Policy::Windowed { inner, .. } => inner.forward(),
            Policy::LocationSensitive => None,
        }
    }
}

/// Attention state carried between decoder steps.
#[derive(Debug, Clone)]
pub struct AttentionState {
    /// Alignment emitted by the previous step, `[1, T_in]`. Zero before the first step.
    pub alignment: Tensor,
    /// Sum of every alignment emitted so far, `[1, T_in]`.
    pub cumulative: Tensor,
    /// Path state for the forward policies.
    pub forward: Option<ForwardState>,
    /// Argmax of the previous alignment.
    pub peak: Option<usize>,
    processed_inputs: Tensor,
}

/// Result of one attention step.
#[derive(Debug, Clone)]
pub struct AttentionOutput {
    /// `[1, T_in]`, sums to one, zero on padded positions.
    pub alignment: Tensor,
    /// `[1, D]` alignment-weighted context.
    pub context: Tensor,
    pub state: AttentionState,
}

#[derive(Debug, Clone)]
pub struct Attention {
    scorer: AdditiveScorer,
    normalization: Normalization,
    policy: Policy,
}

impl Attention {
    pub fn new(
        cfg: &AttentionConfig,
        query_dim: usize,
        context_dim: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let scorer = AdditiveScorer::new(cfg, query_dim, context_dim, vb.clone())?;
        let base = match cfg.policy.base() {
            AttentionPolicy::LocationSensitive => Policy::LocationSensitive,
            AttentionPolicy::Forward => Policy::Forward(ForwardAttention::fixed(cfg.forward_mask)),
            AttentionPolicy::ForwardTransitionAgent => Policy::Forward(
                ForwardAttention::with_agent(context_dim, query_dim, cfg.forward_mask, vb)?,
            ),
            AttentionPolicy::Windowed { .. } => {
                return Err(Error::Config("windowed attention cannot be nested".into()));
            }
        };
        let policy = match cfg.policy.window() {
            Some(half_width) => Policy::Windowed {
                inner: Box::new(base),
                half_width,
            },
            None => base,
        };
        tracing::debug!(policy = ?cfg.policy, normalization = ?cfg.normalization, "attention built");
        Ok(Self {
            scorer,
            normalization: cfg.normalization,
            policy,
        })
    }

    /// Fresh state for a new utterance.
    pub fn init_state(&self, ctx: &ContextSequence) -> Result<AttentionState> {
        let len = ctx.len();
        let zeros = Tensor::zeros((1, len), ctx.dtype(), ctx.device())?;
        let forward = match self.policy.forward() {
            Some(f) => Some(f.init(len, ctx.first_valid(), &zeros)?),
            None => None,
        };
        Ok(AttentionState {
            alignment: zeros.clone(),
            cumulative: zeros,
            forward,
            peak: None,
            processed_inputs: self.scorer.process_inputs(ctx.values())?,
        })
    }

    /// One attention step for `query` (`[1, Q]`).
    pub fn compute(
        &self,
        query: &Tensor,
        ctx: &ContextSequence,
        state: &AttentionState,
    ) -> Result<AttentionOutput> {
        let full = 0..ctx.len();
        self.compute_policy(&self.policy, query, ctx, state, full)
    }

    fn compute_policy(
        &self,
        policy: &Policy,
        query: &Tensor,
        ctx: &ContextSequence,
        state: &AttentionState,
        range: Range<usize>,
    ) -> Result<AttentionOutput> {
        match policy {
            Policy::Windowed { inner, half_width } => {
                // First step has no peak yet and scores the whole sequence.
                let range = match state.peak {
                    Some(peak) => mask::window_range(peak, *half_width, ctx.len()),
                    None => range,
                };
                self.compute_policy(inner, query, ctx, state, range)
            }
            Policy::LocationSensitive => {
                let alignment = self.content_alignment(query, ctx, state, &range)?;
                self.finish(alignment, query, ctx, state, None)
            }
            Policy::Forward(fwd) => {
                let content = self.content_alignment(query, ctx, state, &range)?;
                let prior = state.forward.as_ref().ok_or_else(|| {
                    Error::Alignment("forward attention state missing".into())
                })?;
                let valid = ctx
                    .mask()
                    .mul(&mask::range_mask(&range, ctx.len(), ctx.mask())?)?;
                let alpha = fwd.advance(prior, &content, &valid, state.peak)?;
                self.finish(alpha, query, ctx, state, Some(fwd))
            }
        }
    }

    /// Normalized content alignment over `range`, zero-padded to `[1, T_in]`.
    fn content_alignment(
        &self,
        query: &Tensor,
        ctx: &ContextSequence,
        state: &AttentionState,
        range: &Range<usize>,
    ) -> Result<Tensor> {
        if !ctx.valid()[range.clone()].iter().any(|&v| v) {
            return Err(Error::Alignment(format!(
                "no valid context position in window {range:?}"
            )));
        }
        let energies = self.scorer.energies(
            query,
            &state.processed_inputs,
            &state.alignment,
            &state.cumulative,
            range,
        )?;
        let window_mask = ctx.mask().narrow(1, range.start, range.len())?;
        let weights = mask::normalize(&energies, &window_mask, self.normalization)?;
        Ok(weights.pad_with_zeros(1, range.start, ctx.len() - range.end)?)
    }

    fn finish(
        &self,
        alignment: Tensor,
        query: &Tensor,
        ctx: &ContextSequence,
        state: &AttentionState,
        fwd: Option<&ForwardAttention>,
    ) -> Result<AttentionOutput> {
        let context = alignment
            .unsqueeze(1)?
            .matmul(ctx.values())?
            .squeeze(1)?;
        let forward = match (fwd, &state.forward) {
            (Some(f), Some(prior)) => Some(ForwardState {
                alpha: alignment.clone(),
                transition: f.next_transition(prior, &context, query)?,
            }),
            _ => None,
        };
        let peak = alignment
            .squeeze(0)?
            .argmax(0)?
            .to_dtype(DType::U32)?
            .to_scalar::<u32>()? as usize;
        let next = AttentionState {
            cumulative: state.cumulative.add(&alignment)?,
            alignment: alignment.clone(),
            forward,
            peak: Some(peak),
            processed_inputs: state.processed_inputs.clone(),
        };
        Ok(AttentionOutput {
            alignment,
            context,
            state: next,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;
    use std::collections::HashMap;

    const Q: usize = 6;
    const D: usize = 4;

    fn small_cfg(policy: AttentionPolicy) -> AttentionConfig {
        AttentionConfig {
            policy,
            attention_dim: 8,
            location_filters: 3,
            location_kernel_size: 3,
            ..Default::default()
        }
    }

    fn run_steps(attn: &Attention, ctx: &ContextSequence, steps: usize) -> Vec<Vec<f32>> {
        let dev = Device::Cpu;
        let mut state = attn.init_state(ctx).unwrap();
        let mut out = Vec::new();
        for _ in 0..steps {
            let query = Tensor::randn(0f32, 1.0, (1, Q), &dev).unwrap();
            let step = attn.compute(&query, ctx, &state).unwrap();
            assert_eq!(step.context.dims(), &[1, D]);
            out.push(step.alignment.squeeze(0).unwrap().to_vec1().unwrap());
            state = step.state;
        }
        out
    }

    #[test]
    fn every_policy_emits_masked_distributions() {
        let dev = Device::Cpu;
        let values = Tensor::randn(0f32, 1.0, (7, D), &dev).unwrap();
        let ctx = ContextSequence::with_length(&values, 5).unwrap();
        let policies = [
            AttentionPolicy::LocationSensitive,
            AttentionPolicy::Forward,
            AttentionPolicy::ForwardTransitionAgent,
            AttentionPolicy::Windowed {
                inner: Box::new(AttentionPolicy::LocationSensitive),
                half_width: 1,
            },
            AttentionPolicy::Windowed {
                inner: Box::new(AttentionPolicy::Forward),
                half_width: 2,
            },
        ];
        for normalization in [Normalization::Softmax, Normalization::Sigmoid] {
            for policy in &policies {
                let varmap = VarMap::new();
                let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
                let mut cfg = small_cfg(policy.clone());
                cfg.normalization = normalization;
                let attn = Attention::new(&cfg, Q, D, vb).unwrap();
                for alignment in run_steps(&attn, &ctx, 6) {
                    let sum: f32 = alignment.iter().sum();
                    assert!((sum - 1.0).abs() < 1e-4, "{policy:?}: sum {sum}");
                    assert_eq!(alignment[5], 0.0);
                    assert_eq!(alignment[6], 0.0);
                    assert!(alignment.iter().all(|&w| w >= 0.0));
                }
            }
        }
    }

    #[test]
    fn forward_policy_is_monotonic() {
        let dev = Device::Cpu;
        let values = Tensor::randn(0f32, 1.0, (9, D), &dev).unwrap();
        let ctx = ContextSequence::with_length(&values, 9).unwrap();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let attn = Attention::new(&small_cfg(AttentionPolicy::ForwardTransitionAgent), Q, D, vb)
            .unwrap();
        let steps = run_steps(&attn, &ctx, 8);
        // The initial path is one-hot on position 0.
        let mut prev: Vec<bool> = (0..9).map(|i| i == 0).collect();
        for alignment in steps {
            for (i, &w) in alignment.iter().enumerate() {
                if w > 0.0 {
                    assert!(prev[i] || (i > 0 && prev[i - 1]), "jump to {i}");
                }
            }
            prev = alignment.iter().map(|&w| w > 0.0).collect();
        }
    }

    #[test]
    fn forward_policy_starts_at_first_valid_position() {
        let dev = Device::Cpu;
        let values = Tensor::randn(0f32, 1.0, (5, D), &dev).unwrap();
        let ctx = ContextSequence::new(&values, &[false, false, true, true, true]).unwrap();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let attn = Attention::new(&small_cfg(AttentionPolicy::Forward), Q, D, vb).unwrap();
        let first = &run_steps(&attn, &ctx, 1)[0];
        assert_eq!(first[0], 0.0);
        assert_eq!(first[1], 0.0);
        assert!(first[2] > 0.0);
        assert_eq!(first[4], 0.0);
    }

    /// Weights chosen so the energy peaks sharply at one input position.
    fn peaked_weights(dev: &Device) -> HashMap<String, Tensor> {
        let a = 8;
        let mut ts = HashMap::new();
        ts.insert(
            "query_layer.weight".to_string(),
            Tensor::zeros((a, Q), DType::F32, dev).unwrap(),
        );
        // inputs_layer copies the context channels into the scoring space.
        let mut w_in = vec![0f32; a * D];
        for i in 0..D {
            w_in[i * D + i] = 1.0;
        }
        ts.insert(
            "inputs_layer.weight".to_string(),
            Tensor::from_vec(w_in, (a, D), dev).unwrap(),
        );
        let mut v = vec![0f32; a];
        v[0] = 40.0;
        ts.insert("v.weight".to_string(), Tensor::from_vec(v, (1, a), dev).unwrap());
        ts.insert("v.bias".to_string(), Tensor::zeros(1, DType::F32, dev).unwrap());
        ts
    }

    #[test]
    fn window_matches_unwindowed_when_mass_is_inside() {
        let dev = Device::Cpu;
        let len = 12;
        let target = 6;
        // Channel 0 is large only at `target`.
        let mut vals = vec![0f32; len * D];
        vals[target * D] = 1.0;
        let values = Tensor::from_vec(vals, (len, D), &dev).unwrap();
        let ctx = ContextSequence::with_length(&values, len).unwrap();

        let build = |policy: AttentionPolicy| {
            let vb = VarBuilder::from_tensors(peaked_weights(&dev), DType::F32, &dev);
            let cfg = AttentionConfig {
                location_features: false,
                ..small_cfg(policy)
            };
            Attention::new(&cfg, Q, D, vb).unwrap()
        };
        let plain = build(AttentionPolicy::LocationSensitive);
        let windowed = build(AttentionPolicy::Windowed {
            inner: Box::new(AttentionPolicy::LocationSensitive),
            half_width: 3,
        });

        let query = Tensor::zeros((1, Q), DType::F32, &dev).unwrap();
        let mut s_plain = plain.init_state(&ctx).unwrap();
        let mut s_win = windowed.init_state(&ctx).unwrap();
        for _ in 0..3 {
            let a = plain.compute(&query, &ctx, &s_plain).unwrap();
            let b = windowed.compute(&query, &ctx, &s_win).unwrap();
            let a_vals: Vec<f32> = a.alignment.squeeze(0).unwrap().to_vec1().unwrap();
            let b_vals: Vec<f32> = b.alignment.squeeze(0).unwrap().to_vec1().unwrap();
            assert_eq!(a.state.peak, Some(target));
            for (x, y) in a_vals.iter().zip(&b_vals) {
                assert!((x - y).abs() < 1e-4, "{a_vals:?} vs {b_vals:?}");
            }
            s_plain = a.state;
            s_win = b.state;
        }
    }

    #[test]
    fn window_matches_unwindowed_with_location_features() {
        let dev = Device::Cpu;
        let len = 12;
        let target = 6;
        let mut vals = vec![0f32; len * D];
        vals[target * D] = 1.0;
        let values = Tensor::from_vec(vals, (len, D), &dev).unwrap();
        let ctx = ContextSequence::with_length(&values, len).unwrap();

        let mut weights = peaked_weights(&dev);
        // Asymmetric taps so a misaligned halo would shift the features.
        let conv: Vec<f32> = (0..3 * 2 * 3).map(|i| 0.02 * (i % 5) as f32).collect();
        weights.insert(
            "location_layer.location_conv.weight".to_string(),
            Tensor::from_vec(conv, (3, 2, 3), &dev).unwrap(),
        );
        let mut dense = vec![0f32; 8 * 3];
        dense[..3].copy_from_slice(&[0.3, -0.2, 0.1]);
        weights.insert(
            "location_layer.location_dense.weight".to_string(),
            Tensor::from_vec(dense, (8, 3), &dev).unwrap(),
        );

        let build = |policy: AttentionPolicy| {
            let vb = VarBuilder::from_tensors(weights.clone(), DType::F32, &dev);
            Attention::new(&small_cfg(policy), Q, D, vb).unwrap()
        };
        let plain = build(AttentionPolicy::LocationSensitive);
        let windowed = build(AttentionPolicy::Windowed {
            inner: Box::new(AttentionPolicy::LocationSensitive),
            half_width: 3,
        });

        let query = Tensor::zeros((1, Q), DType::F32, &dev).unwrap();
        let mut s_plain = plain.init_state(&ctx).unwrap();
        let mut s_win = windowed.init_state(&ctx).unwrap();
        for _ in 0..4 {
            let a = plain.compute(&query, &ctx, &s_plain).unwrap();
            let b = windowed.compute(&query, &ctx, &s_win).unwrap();
            let a_vals: Vec<f32> = a.alignment.squeeze(0).unwrap().to_vec1().unwrap();
            let b_vals: Vec<f32> = b.alignment.squeeze(0).unwrap().to_vec1().unwrap();
            assert_eq!(a.state.peak, Some(target));
            assert_eq!(b.state.peak, Some(target));
            for (x, y) in a_vals.iter().zip(&b_vals) {
                assert!((x - y).abs() < 1e-4, "{a_vals:?} vs {b_vals:?}");
            }
            let a_cum: Vec<f32> = a.state.cumulative.squeeze(0).unwrap().to_vec1().unwrap();
            let b_cum: Vec<f32> = b.state.cumulative.squeeze(0).unwrap().to_vec1().unwrap();
            for (x, y) in a_cum.iter().zip(&b_cum) {
                assert!((x - y).abs() < 1e-4);
            }
            s_plain = a.state;
            s_win = b.state;
        }
    }

    #[test]
    fn window_matches_unwindowed_forward_path() {
        let dev = Device::Cpu;
        let len = 10;
        let values = Tensor::randn(0f32, 1.0, (len, D), &dev).unwrap();
        let ctx = ContextSequence::with_length(&values, len).unwrap();
        // The path starts at 0 and moves at most one position per step, so
        // after four steps it stays inside a half-width-4 window.
        let half_width = 4;
        let steps = 4;

        for inner in [AttentionPolicy::Forward, AttentionPolicy::ForwardTransitionAgent] {
            for forward_mask in [false, true] {
                for normalization in [Normalization::Softmax, Normalization::Sigmoid] {
                    // One VarMap: both modules resolve to the same parameters.
                    let varmap = VarMap::new();
                    let build = |policy: AttentionPolicy| {
                        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
                        let cfg = AttentionConfig {
                            normalization,
                            forward_mask,
                            ..small_cfg(policy)
                        };
                        Attention::new(&cfg, Q, D, vb).unwrap()
                    };
                    let plain = build(inner.clone());
                    let windowed = build(AttentionPolicy::Windowed {
                        inner: Box::new(inner.clone()),
                        half_width,
                    });

                    let mut s_plain = plain.init_state(&ctx).unwrap();
                    let mut s_win = windowed.init_state(&ctx).unwrap();
                    for _ in 0..steps {
                        let query = Tensor::randn(0f32, 1.0, (1, Q), &dev).unwrap();
                        let a = plain.compute(&query, &ctx, &s_plain).unwrap();
                        let b = windowed.compute(&query, &ctx, &s_win).unwrap();
                        let a_vals: Vec<f32> = a.alignment.squeeze(0).unwrap().to_vec1().unwrap();
                        let b_vals: Vec<f32> = b.alignment.squeeze(0).unwrap().to_vec1().unwrap();
                        for (x, y) in a_vals.iter().zip(&b_vals) {
                            assert!(
                                (x - y).abs() < 1e-5,
                                "{inner:?} mask={forward_mask}: {a_vals:?} vs {b_vals:?}"
                            );
                        }
                        assert_eq!(a.state.peak, b.state.peak);
                        let a_ctx: Vec<f32> = a.context.squeeze(0).unwrap().to_vec1().unwrap();
                        let b_ctx: Vec<f32> = b.context.squeeze(0).unwrap().to_vec1().unwrap();
                        for (x, y) in a_ctx.iter().zip(&b_ctx) {
                            assert!((x - y).abs() < 1e-5);
                        }
                        s_plain = a.state;
                        s_win = b.state;
                    }
                }
            }
        }
    }
}
