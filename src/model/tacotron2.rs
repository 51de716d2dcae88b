//! Full decoder stack: conditioning, decoder(s) and postnet.

use candle_core::{Module, Tensor};
use candle_nn::{Embedding, VarBuilder};

use super::decoder::{DecodeSession, Decoder, DecoderOutput};
use super::diagnostics::{l1_distance, reverse_time};
use super::postnet::Postnet;
use super::prenet::DropoutRng;
use super::style::{StyleEncoder, StyleInput};
use crate::config::{Capabilities, Tacotron2Config};
use crate::context::ContextSequence;
use crate::{Error, Result};

/// Per-utterance conditioning.
#[derive(Debug, Clone, Default)]
pub struct Conditioning {
    pub speaker_id: Option<u32>,
    pub style: Option<StyleInput>,
}

impl Conditioning {
    pub fn speaker(id: u32) -> Self {
        Self {
            speaker_id: Some(id),
            style: None,
        }
    }

    pub fn with_style(mut self, style: StyleInput) -> Self {
        self.style = Some(style);
        self
    }
}

/// Time-reversed decoder pass, mapped back into forward time.
#[derive(Debug, Clone)]
pub struct BackwardOutput {
    /// `[N, frame_dim]` frames, aligned with the target.
    pub frames: Tensor,
    /// `[N, T_in]` alignments, aligned with the target.
    pub alignments: Tensor,
    /// Mean absolute difference to the forward decoder's frames.
    pub consistency: f32,
}

#[derive(Debug, Clone)]
pub struct Tacotron2Output {
    /// Raw decoder output.
    pub decoder: DecoderOutput,
    /// `[T_out, frame_dim]` frames after the postnet residual.
    pub frames: Tensor,
    /// Present for teacher-forced decodes on bidirectional models.
    pub backward: Option<BackwardOutput>,
}

#[derive(Debug, Clone)]
pub struct Tacotron2 {
    config: Tacotron2Config,
    capabilities: Capabilities,
    speaker_embedding: Option<Embedding>,
    style: Option<StyleEncoder>,
    decoder: Decoder,
    decoder_backward: Option<Decoder>,
    postnet: Postnet,
}

impl Tacotron2 {
    pub fn new(config: &Tacotron2Config, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let capabilities = config.capabilities();
        let context_dim = config.context_dim();

        let speaker_embedding = if capabilities.has_speaker_conditioning {
            Some(candle_nn::embedding(
                config.num_speakers,
                config.speaker_embedding_dim,
                vb.pp("speaker_embedding"),
            )?)
        } else {
            None
        };
        let style = match &config.style {
            Some(cfg) => Some(StyleEncoder::new(cfg, vb.pp("gst"))?),
            None => None,
        };
        let decoder = Decoder::new(&config.decoder, &config.attention, context_dim, vb.pp("decoder"))?;
        let decoder_backward = if capabilities.has_backward_decoder {
            Some(Decoder::new(
                &config.decoder,
                &config.attention,
                context_dim,
                vb.pp("decoder_backward"),
            )?)
        } else {
            None
        };
        let postnet = Postnet::new(&config.postnet, config.decoder.frame_dim, vb.pp("postnet"))?;

        tracing::info!(
            context_dim,
            speakers = config.num_speakers,
            style = capabilities.has_style_conditioning,
            bidirectional = capabilities.has_backward_decoder,
            "tacotron2 decoder stack built"
        );
        Ok(Self {
            config: config.clone(),
            capabilities,
            speaker_embedding,
            style,
            decoder,
            decoder_backward,
            postnet,
        })
    }

    pub fn config(&self) -> &Tacotron2Config {
        &self.config
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    pub fn postnet(&self) -> &Postnet {
        &self.postnet
    }

    /// Append style and speaker vectors to the encoder context.
    ///
    /// Fails with [`Error::Conditioning`] whenever `cond` does not match the
    /// model's capabilities.
    pub fn condition(&self, ctx: &ContextSequence, cond: &Conditioning) -> Result<ContextSequence> {
        if ctx.width() != self.config.encoder_dim {
            return Err(Error::Input(format!(
                "context width {} does not match encoder_dim {}",
                ctx.width(),
                self.config.encoder_dim
            )));
        }
        let mut vectors = Vec::new();

        match (&self.style, &cond.style) {
            (Some(style), Some(input)) => vectors.push(style.forward(input)?),
            (Some(_), None) => {
                return Err(Error::Conditioning(
                    "style model invoked without a style input".into(),
                ));
            }
            (None, Some(_)) => {
                return Err(Error::Conditioning(
                    "style input given to a model without a style token layer".into(),
                ));
            }
            (None, None) => {}
        }

        match (&self.speaker_embedding, cond.speaker_id) {
            (Some(table), Some(id)) => {
                if id as usize >= self.config.num_speakers {
                    return Err(Error::Conditioning(format!(
                        "speaker id {id} out of range for {} speakers",
                        self.config.num_speakers
                    )));
                }
                let ids = Tensor::new(&[id], ctx.device())?;
                vectors.push(table.forward(&ids)?);
            }
            (Some(_), None) => {
                return Err(Error::Conditioning(
                    "multi-speaker model invoked without a speaker id".into(),
                ));
            }
            (None, Some(id)) => {
                return Err(Error::Conditioning(format!(
                    "speaker id {id} given to a single-speaker model"
                )));
            }
            (None, None) => {}
        }

        let refs: Vec<&Tensor> = vectors.iter().collect();
        ctx.concat_conditioning(&refs)
    }

    /// Free-running synthesis from an unconditioned encoder context.
    pub fn inference(
        &self,
        ctx: &ContextSequence,
        cond: &Conditioning,
        seed: Option<u64>,
    ) -> Result<Tacotron2Output> {
        let ctx = self.condition(ctx, cond)?;
        let decoder = self.decoder.inference(&ctx, DropoutRng::from_seed(seed))?;
        let frames = self.postnet.refine(&decoder.frames)?;
        Ok(Tacotron2Output {
            decoder,
            frames,
            backward: None,
        })
    }

    /// Resumable free-running decode over an already conditioned context.
    pub fn session<'a>(
        &'a self,
        conditioned: &'a ContextSequence,
        seed: Option<u64>,
    ) -> Result<DecodeSession<'a>> {
        self.decoder.session(conditioned, DropoutRng::from_seed(seed))
    }

    /// Decode against a ground-truth target `[N, frame_dim]`.
    ///
    /// On bidirectional models the backward decoder runs over the reversed
    /// target on a second thread, sharing only the conditioned context.
    pub fn teacher_forced(
        &self,
        ctx: &ContextSequence,
        cond: &Conditioning,
        target: &Tensor,
        seed: Option<u64>,
    ) -> Result<Tacotron2Output> {
        let ctx = self.condition(ctx, cond)?;
        let n = target.dim(0)?;

        let (forward, backward) = match &self.decoder_backward {
            None => {
                let mut rng = DropoutRng::from_seed(seed);
                (self.decoder.teacher_forced(&ctx, target, &mut rng)?, None)
            }
            Some(decoder_backward) => {
                let reversed = reverse_time(target)?;
                let (fwd, bwd) = std::thread::scope(|s| {
                    let handle = s.spawn(|| {
                        let mut rng = DropoutRng::from_seed(seed.map(|v| v.wrapping_add(1)));
                        decoder_backward.teacher_forced(&ctx, &reversed, &mut rng)
                    });
                    let mut rng = DropoutRng::from_seed(seed);
                    let fwd = self.decoder.teacher_forced(&ctx, target, &mut rng);
                    let bwd = handle
                        .join()
                        .map_err(|_| Error::Worker("backward decoder panicked".into()));
                    (fwd, bwd)
                });
                let fwd = fwd?;
                let bwd = bwd??;

                // Padding frames sit at the end of the reversed pass; drop them
                // before mapping back to forward time.
                let frames = reverse_time(&bwd.frames.narrow(0, 0, n)?)?;
                let alignments = reverse_time(&bwd.alignments.narrow(0, 0, n)?)?;
                let consistency = l1_distance(&frames, &fwd.frames.narrow(0, 0, n)?)?;
                tracing::debug!(consistency, "backward decoder finished");
                (
                    fwd,
                    Some(BackwardOutput {
                        frames,
                        alignments,
                        consistency,
                    }),
                )
            }
        };

        let frames = self.postnet.refine(&forward.frames)?;
        Ok(Tacotron2Output {
            decoder: forward,
            frames,
            backward,
        })
    }
}
