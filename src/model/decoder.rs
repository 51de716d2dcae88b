//! Autoregressive attention decoder.
//!
//! ```text
//! prev frame ─► prenet ─┐
//!                       ├─► attention LSTM ─► query ─► attention ─► context
//! prev context ─────────┘                                  │
//!                      [query ‖ context] ─► decoder LSTM ─► hidden
//!                      [hidden ‖ context] ─► projection ─► r frames
//!                                         └► stopnet   ─► stop logit
//! ```
//!
//! [`Decoder::step`] is pure: it takes a [`DecoderState`] by value and returns
//! the next one. The loops in this module only thread that state through and
//! collect per-step outputs.

use candle_core::{IndexOp, Module, Tensor};
use candle_nn::rnn::{LSTM, LSTMConfig, LSTMState, RNN};
use candle_nn::{Linear, VarBuilder};

use super::attention::{Attention, AttentionState};
use super::prenet::{DropoutRng, Prenet};
use super::stopnet::{StopNet, stop_probability};
use crate::config::{AttentionConfig, DecoderConfig};
use crate::context::ContextSequence;
use crate::{Error, Result};

/// Consecutive above-threshold steps needed to stop a free-running decode.
const STOP_PATIENCE: usize = 2;

/// Why a decode loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Stop probability exceeded the threshold.
    StopToken,
    /// Free-running decode hit `max_decoder_steps`.
    StepBudget,
    /// Teacher-forced decode consumed every target frame.
    TargetExhausted,
}

/// Everything the decoder carries from one step to the next.
#[derive(Debug, Clone)]
pub struct DecoderState {
    pub query: LSTMState,
    pub hidden: LSTMState,
    /// `[1, D]` attention context from the previous step.
    pub context: Tensor,
    pub attention: AttentionState,
    /// `[1, frame_dim]` input to the next step's prenet.
    pub prev_frame: Tensor,
    /// Steps taken so far.
    pub step: usize,
}

/// Output of a single decoder step.
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// `[r, frame_dim]`.
    pub frames: Tensor,
    pub stop_logit: f32,
    /// `[1, T_in]`.
    pub alignment: Tensor,
}

/// Collected output of a decode loop.
#[derive(Debug, Clone)]
pub struct DecoderOutput {
    /// `[T_out, frame_dim]` with `T_out = steps · r`.
    pub frames: Tensor,
    /// `[T_out]`; each step's logit repeated for its `r` frames.
    pub stop_logits: Tensor,
    /// `[T_out, T_in]`; each step's alignment repeated for its `r` frames.
    pub alignments: Tensor,
    /// `[steps, T_in]`, one row per decoder step.
    pub step_alignments: Tensor,
    pub steps: usize,
    pub termination: Termination,
}

#[derive(Debug, Clone)]
pub struct Decoder {
    prenet: Prenet,
    attention_rnn: LSTM,
    attention: Attention,
    decoder_rnn: LSTM,
    projection: Linear,
    stopnet: StopNet,
    frame_dim: usize,
    frames_per_step: usize,
    max_steps: usize,
    stop_threshold: f32,
}

impl Decoder {
    pub fn new(
        cfg: &DecoderConfig,
        attn_cfg: &AttentionConfig,
        context_dim: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let prenet = Prenet::new(cfg, vb.pp("prenet"))?;
        let attention_rnn = candle_nn::lstm(
            prenet.out_dim() + context_dim,
            cfg.query_dim,
            LSTMConfig::default(),
            vb.pp("attention_rnn"),
        )?;
        let attention = Attention::new(attn_cfg, cfg.query_dim, context_dim, vb.pp("attention"))?;
        let decoder_rnn = candle_nn::lstm(
            cfg.query_dim + context_dim,
            cfg.decoder_rnn_dim,
            LSTMConfig::default(),
            vb.pp("decoder_rnn"),
        )?;
        let hidden_context = cfg.decoder_rnn_dim + context_dim;
        let projection = candle_nn::linear(
            hidden_context,
            cfg.frame_dim * cfg.frames_per_step,
            vb.pp("linear_projection"),
        )?;
        let stopnet = StopNet::new(hidden_context, cfg.separate_stopnet, vb.pp("stopnet"))?;
        Ok(Self {
            prenet,
            attention_rnn,
            attention,
            decoder_rnn,
            projection,
            stopnet,
            frame_dim: cfg.frame_dim,
            frames_per_step: cfg.frames_per_step,
            max_steps: cfg.max_decoder_steps,
            stop_threshold: cfg.stop_threshold,
        })
    }

    pub fn frame_dim(&self) -> usize {
        self.frame_dim
    }

    pub fn frames_per_step(&self) -> usize {
        self.frames_per_step
    }

    /// Zero recurrent state, zero context, all-zero "go" frame.
    pub fn init_state(&self, ctx: &ContextSequence) -> Result<DecoderState> {
        let (dev, dtype) = (ctx.device(), ctx.dtype());
        Ok(DecoderState {
            query: self.attention_rnn.zero_state(1)?,
            hidden: self.decoder_rnn.zero_state(1)?,
            context: Tensor::zeros((1, ctx.width()), dtype, dev)?,
            attention: self.attention.init_state(ctx)?,
            prev_frame: Tensor::zeros((1, self.frame_dim), dtype, dev)?,
            step: 0,
        })
    }

    /// Advance one step. Reads `state.prev_frame` as input.
    pub fn step(
        &self,
        state: DecoderState,
        ctx: &ContextSequence,
        rng: &mut DropoutRng,
    ) -> Result<(DecoderState, StepOutput)> {
        let memory = self.prenet.forward(&state.prev_frame, rng)?;
        let query_input = Tensor::cat(&[&memory, &state.context], 1)?;
        let query = self.attention_rnn.step(&query_input, &state.query)?;

        let attn = self.attention.compute(query.h(), ctx, &state.attention)?;

        let decoder_input = Tensor::cat(&[query.h(), &attn.context], 1)?;
        let hidden = self.decoder_rnn.step(&decoder_input, &state.hidden)?;

        let hidden_context = Tensor::cat(&[hidden.h(), &attn.context], 1)?;
        let flat = self.projection.forward(&hidden_context)?; // [1, r * F]
        let stop_logit = self
            .stopnet
            .forward(&hidden_context)?
            .flatten_all()?
            .to_dtype(candle_core::DType::F32)?
            .i(0)?
            .to_scalar::<f32>()?;

        let frames = flat.reshape((self.frames_per_step, self.frame_dim))?;
        let prev_frame = frames.i(self.frames_per_step - 1..)?;

        let next = DecoderState {
            query,
            hidden,
            context: attn.context,
            attention: attn.state,
            prev_frame,
            step: state.step + 1,
        };
        Ok((
            next,
            StepOutput {
                frames,
                stop_logit,
                alignment: attn.alignment,
            },
        ))
    }

    /// Decode against a ground-truth target `[N, frame_dim]`.
    ///
    /// Runs `ceil(N / r)` steps, feeding the last target frame of each group
    /// as the next input. The target is zero-padded to a multiple of `r`, so
    /// the output has `ceil(N / r) · r` frames.
    pub fn teacher_forced(
        &self,
        ctx: &ContextSequence,
        target: &Tensor,
        rng: &mut DropoutRng,
    ) -> Result<DecoderOutput> {
        let (n, width) = target.dims2()?;
        if width != self.frame_dim {
            return Err(Error::Input(format!(
                "target width {width} does not match frame_dim {}",
                self.frame_dim
            )));
        }
        if n == 0 {
            return Err(Error::Input("target has no frames".into()));
        }
        let r = self.frames_per_step;
        let steps = n.div_ceil(r);
        tracing::debug!(t_in = ctx.len(), r, target_frames = n, "teacher-forced decode started");
        let target = target
            .to_dtype(ctx.dtype())?
            .pad_with_zeros(0, 0, steps * r - n)?;

        let mut acc = Collector::new(r);
        let mut state = self.init_state(ctx)?;
        for s in 0..steps {
            if s > 0 {
                state.prev_frame = target.i(s * r - 1..s * r)?;
            }
            let (next, out) = self.step(state, ctx, rng)?;
            acc.push(out);
            state = next;
        }
        tracing::debug!(steps, frames = steps * r, "teacher-forced decode finished");
        acc.finish(Termination::TargetExhausted)
    }

    /// Free-running decode until the stop token fires or the budget runs out.
    pub fn inference(&self, ctx: &ContextSequence, rng: DropoutRng) -> Result<DecoderOutput> {
        let mut session = self.session(ctx, rng)?;
        session.advance(self.max_steps)?;
        session.finish()
    }

    /// Start a resumable free-running decode.
    pub fn session<'a>(
        &'a self,
        ctx: &'a ContextSequence,
        rng: DropoutRng,
    ) -> Result<DecodeSession<'a>> {
        tracing::debug!(
            t_in = ctx.len(),
            r = self.frames_per_step,
            max_steps = self.max_steps,
            "decode started"
        );
        Ok(DecodeSession {
            decoder: self,
            ctx,
            state: Some(self.init_state(ctx)?),
            rng,
            acc: Collector::new(self.frames_per_step),
            above_threshold: 0,
            termination: None,
            failed: None,
        })
    }
}

/// A free-running decode that can be advanced in chunks.
///
/// Each [`advance`](DecodeSession::advance) returns the frames produced by
/// that call, so callers can stream output while the decode continues.
pub struct DecodeSession<'a> {
    decoder: &'a Decoder,
    ctx: &'a ContextSequence,
    state: Option<DecoderState>,
    rng: DropoutRng,
    acc: Collector,
    above_threshold: usize,
    termination: Option<Termination>,
    /// Set once a step fails; the session refuses further work.
    failed: Option<String>,
}

impl DecodeSession<'_> {
    /// Run up to `max_steps` more steps. Returns this chunk's frames
    /// `[n · r, frame_dim]`, or `None` if the decode has already ended.
    ///
    /// A failed step poisons the session: the error is returned once and
    /// every later call returns [`Error::Session`].
    pub fn advance(&mut self, max_steps: usize) -> Result<Option<Tensor>> {
        if let Some(reason) = &self.failed {
            return Err(Error::Session(format!("an earlier step failed: {reason}")));
        }
        let decoder = self.decoder;
        let mut chunk = Vec::new();
        for _ in 0..max_steps {
            if self.termination.is_some() {
                break;
            }
            let Some(state) = self.state.as_ref() else {
                return Err(Error::Session("decoder state is missing".into()));
            };
            let (next, out) = match decoder.step(state.clone(), self.ctx, &mut self.rng) {
                Ok(stepped) => stepped,
                Err(err) => {
                    tracing::warn!(step = state.step, error = %err, "decode step failed");
                    self.failed = Some(err.to_string());
                    return Err(err);
                }
            };
            let step = next.step;
            let prob = stop_probability(out.stop_logit);
            chunk.push(out.frames.clone());
            self.acc.push(out);
            self.state = Some(next);

            if prob > decoder.stop_threshold {
                self.above_threshold += 1;
            } else {
                self.above_threshold = 0;
            }
            if self.above_threshold >= STOP_PATIENCE {
                tracing::debug!(step, "stop token fired");
                self.termination = Some(Termination::StopToken);
            } else if step >= decoder.max_steps {
                tracing::warn!(
                    max_steps = decoder.max_steps,
                    "decoder reached max_decoder_steps without a stop token"
                );
                self.termination = Some(Termination::StepBudget);
            }
        }
        if chunk.is_empty() {
            return Ok(None);
        }
        Ok(Some(Tensor::cat(&chunk, 0)?))
    }

    /// Steps taken so far.
    pub fn steps(&self) -> usize {
        self.acc.steps()
    }

    /// `Some` once the decode has ended.
    pub fn termination(&self) -> Option<Termination> {
        self.termination
    }

    /// Run to completion and collect the full output.
    pub fn finish(mut self) -> Result<DecoderOutput> {
        while self.termination.is_none() {
            let remaining = self.decoder.max_steps.saturating_sub(self.steps()).max(1);
            let before = self.steps();
            self.advance(remaining)?;
            if self.steps() == before && self.termination.is_none() {
                return Err(Error::Session("decode made no progress".into()));
            }
        }
        let termination = self.termination.unwrap_or(Termination::StepBudget);
        tracing::debug!(steps = self.steps(), ?termination, "decode finished");
        self.acc.finish(termination)
    }
}

/// Accumulates per-step outputs into frame-level tensors.
struct Collector {
    frames_per_step: usize,
    frames: Vec<Tensor>,
    stop_logits: Vec<f32>,
    alignments: Vec<Tensor>,
}

impl Collector {
    fn new(frames_per_step: usize) -> Self {
        Self {
            frames_per_step,
            frames: Vec::new(),
            stop_logits: Vec::new(),
            alignments: Vec::new(),
        }
    }

    fn steps(&self) -> usize {
        self.frames.len()
    }

    fn push(&mut self, out: StepOutput) {
        self.frames.push(out.frames);
        self.stop_logits.push(out.stop_logit);
        self.alignments.push(out.alignment);
    }

    fn finish(self, termination: Termination) -> Result<DecoderOutput> {
        let steps = self.steps();
        if steps == 0 {
            return Err(Error::Input("decode produced no steps".into()));
        }
        let r = self.frames_per_step;
        let device = self.frames[0].device().clone();
        let frames = Tensor::cat(&self.frames, 0)?;
        let step_alignments = Tensor::cat(&self.alignments, 0)?;

        let stop_logits: Vec<f32> = self
            .stop_logits
            .iter()
            .flat_map(|&l| std::iter::repeat_n(l, r))
            .collect();
        let stop_logits = Tensor::from_vec(stop_logits, steps * r, &device)?;

        let alignments = if r == 1 {
            step_alignments.clone()
        } else {
            let idx: Vec<u32> = (0..steps * r).map(|i| (i / r) as u32).collect();
            let idx = Tensor::from_vec(idx, steps * r, &device)?;
            step_alignments.index_select(&idx, 0)?
        };

        Ok(DecoderOutput {
            frames,
            stop_logits,
            alignments,
            step_alignments,
            steps,
            termination,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AttentionPolicy, Normalization};
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn small(r: usize, max_steps: usize) -> (DecoderConfig, AttentionConfig) {
        let dec = DecoderConfig {
            frame_dim: 5,
            frames_per_step: r,
            prenet_dims: vec![8, 8],
            prenet_dropout: false,
            query_dim: 12,
            decoder_rnn_dim: 12,
            max_decoder_steps: max_steps,
            ..Default::default()
        };
        let attn = AttentionConfig {
            attention_dim: 6,
            location_filters: 3,
            location_kernel_size: 3,
            ..Default::default()
        };
        (dec, attn)
    }

    fn random_decoder(dec: &DecoderConfig, attn: &AttentionConfig, width: usize) -> Decoder {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        Decoder::new(dec, attn, width, vb).unwrap()
    }

    fn context(len: usize, valid: usize, width: usize) -> ContextSequence {
        let values = Tensor::randn(0f32, 1.0, (len, width), &Device::Cpu).unwrap();
        ContextSequence::with_length(&values, valid).unwrap()
    }

    #[test]
    fn teacher_forced_pads_to_whole_steps() {
        let (dec, attn) = small(3, 50);
        let decoder = random_decoder(&dec, &attn, 4);
        let ctx = context(6, 4, 4);
        let target = Tensor::randn(0f32, 1.0, (7, 5), &Device::Cpu).unwrap();
        let out = decoder
            .teacher_forced(&ctx, &target, &mut DropoutRng::Thread)
            .unwrap();
        assert_eq!(out.steps, 3);
        assert_eq!(out.frames.dims(), &[9, 5]);
        assert_eq!(out.stop_logits.dims(), &[9]);
        assert_eq!(out.alignments.dims(), &[9, 6]);
        assert_eq!(out.step_alignments.dims(), &[3, 6]);
        assert_eq!(out.termination, Termination::TargetExhausted);

        // Frames within one step share their stop logit.
        let logits: Vec<f32> = out.stop_logits.to_vec1().unwrap();
        assert_eq!(logits[0], logits[2]);
        assert_eq!(logits[3], logits[5]);
    }

    #[test]
    fn teacher_forced_is_deterministic_without_dropout() {
        let (dec, attn) = small(1, 50);
        let decoder = random_decoder(&dec, &attn, 4);
        let ctx = context(5, 5, 4);
        let target = Tensor::randn(0f32, 1.0, (4, 5), &Device::Cpu).unwrap();
        let a = decoder
            .teacher_forced(&ctx, &target, &mut DropoutRng::Thread)
            .unwrap();
        let b = decoder
            .teacher_forced(&ctx, &target, &mut DropoutRng::Thread)
            .unwrap();
        let a: Vec<Vec<f32>> = a.frames.to_vec2().unwrap();
        let b: Vec<Vec<f32>> = b.frames.to_vec2().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn teacher_forced_rejects_wrong_width() {
        let (dec, attn) = small(1, 50);
        let decoder = random_decoder(&dec, &attn, 4);
        let ctx = context(5, 5, 4);
        let target = Tensor::zeros((4, 7), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            decoder.teacher_forced(&ctx, &target, &mut DropoutRng::Thread),
            Err(Error::Input(_))
        ));
    }

    #[test]
    fn inference_stops_at_step_budget() {
        let (dec, attn) = small(2, 7);
        // Zero weights: stop probability is exactly 0.5, never above threshold.
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let decoder = Decoder::new(&dec, &attn, 4, vb).unwrap();
        let ctx = context(6, 6, 4);
        let out = decoder.inference(&ctx, DropoutRng::Thread).unwrap();
        assert_eq!(out.termination, Termination::StepBudget);
        assert_eq!(out.steps, 7);
        assert_eq!(out.frames.dims(), &[14, 5]);
    }

    #[test]
    fn inference_stops_after_two_confident_steps() {
        let (dec, attn) = small(1, 100);
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let decoder = Decoder::new(&dec, &attn, 4, vb).unwrap();
        // Push the stop bias far positive so every step is over threshold.
        for (name, var) in varmap.data().lock().unwrap().iter() {
            if name == "stopnet.linear.bias" {
                var.set(&Tensor::new(&[50f32], &dev).unwrap()).unwrap();
            }
        }
        let ctx = context(4, 4, 4);
        let out = decoder.inference(&ctx, DropoutRng::Thread).unwrap();
        assert_eq!(out.termination, Termination::StopToken);
        assert_eq!(out.steps, 2);
    }

    #[test]
    fn first_step_on_zero_context_is_uniform() {
        let (dec, attn) = small(1, 10);
        let decoder = random_decoder(&dec, &attn, 8);
        let values = Tensor::zeros((5, 8), DType::F32, &Device::Cpu).unwrap();
        let ctx = ContextSequence::with_length(&values, 5).unwrap();
        let state = decoder.init_state(&ctx).unwrap();
        let (_, out) = decoder.step(state, &ctx, &mut DropoutRng::Thread).unwrap();
        let w: Vec<f32> = out.alignment.squeeze(0).unwrap().to_vec1().unwrap();
        assert_eq!(w.len(), 5);
        assert!((w.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        assert!(w[0] + 1e-6 >= w[4]);
    }

    #[test]
    fn first_step_on_random_context_is_a_distribution() {
        let (dec, attn) = small(1, 10);
        let decoder = random_decoder(&dec, &attn, 8);
        let ctx = context(5, 5, 8);
        let state = decoder.init_state(&ctx).unwrap();
        let (_, out) = decoder.step(state, &ctx, &mut DropoutRng::Thread).unwrap();
        let w: Vec<f32> = out.alignment.squeeze(0).unwrap().to_vec1().unwrap();
        assert_eq!(w.len(), 5);
        assert!((w.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        assert!(w.iter().all(|&x| x >= 0.0));
    }

    #[test]
    fn failed_step_poisons_session() {
        let (dec, mut attn) = small(1, 20);
        attn.normalization = Normalization::Sigmoid;
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let decoder = Decoder::new(&dec, &attn, 4, vb).unwrap();
        // Every sigmoid score underflows to zero, so the first step has no mass.
        for (name, var) in varmap.data().lock().unwrap().iter() {
            if name == "attention.v.bias" {
                var.set(&Tensor::new(&[-1e4f32], &dev).unwrap()).unwrap();
            }
        }
        let ctx = context(4, 4, 4);

        let mut session = decoder.session(&ctx, DropoutRng::Thread).unwrap();
        assert!(matches!(session.advance(3), Err(Error::Alignment(_))));
        assert!(matches!(session.advance(3), Err(Error::Session(_))));
        assert_eq!(session.steps(), 0);
        assert!(session.termination().is_none());
        assert!(matches!(session.finish(), Err(Error::Session(_))));

        let fresh = decoder.session(&ctx, DropoutRng::Thread).unwrap();
        assert!(matches!(fresh.finish(), Err(Error::Alignment(_))));
    }

    #[test]
    fn session_chunks_concatenate_to_full_output() {
        let (dec, mut attn) = small(2, 9);
        attn.policy = AttentionPolicy::Forward;
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let decoder = Decoder::new(&dec, &attn, 4, vb).unwrap();
        let ctx = context(5, 5, 4);

        let mut session = decoder.session(&ctx, DropoutRng::Thread).unwrap();
        let first = session.advance(4).unwrap().unwrap();
        assert_eq!(first.dims(), &[8, 5]);
        assert_eq!(session.steps(), 4);
        assert!(session.termination().is_none());
        let rest = session.advance(100).unwrap().unwrap();
        assert_eq!(rest.dims(), &[10, 5]);
        assert_eq!(session.termination(), Some(Termination::StepBudget));
        assert!(session.advance(1).unwrap().is_none());
        let out = session.finish().unwrap();
        assert_eq!(out.steps, 9);
    }
}
