//! End-to-end synthesis: tokens → encoder → decoder stack → frames.
//!
//! The sequence encoder is an external collaborator behind the
//! [`SequenceEncoder`] trait. [`DecodeManager`] decodes independent
//! utterances in parallel on tokio's blocking pool; each utterance owns all of
//! its mutable decode state, so nothing is shared between tasks except the
//! read-only model.
//!
//! # Example
//!
//! ```no_run
//! use candle_core::{DType, Device};
//! use candle_nn::VarMap;
//! use tacotron2_rs::config::Tacotron2Config;
//! use tacotron2_rs::pipeline::{DecodeManager, EmbeddingEncoder, SynthesisRequest, Synthesizer};
//!
//! #[tokio::main]
//! async fn main() {
//!     let varmap = VarMap::new();
//!     let vb = candle_nn::VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
//!     let cfg = Tacotron2Config::default();
//!     let encoder = EmbeddingEncoder::new(64, cfg.encoder_dim, vb.pp("encoder")).unwrap();
//!     let synth = Synthesizer::new(encoder, &cfg, vb).unwrap();
//!     let manager = DecodeManager::new(synth);
//!     let out = manager.synthesize(SynthesisRequest::new(vec![3, 7, 9])).await.unwrap();
//!     println!("{:?}", out.frames.dims());
//! }
//! ```

use std::sync::Arc;

use candle_core::{Module, Tensor};
use candle_nn::{Embedding, VarBuilder};

use crate::config::Tacotron2Config;
use crate::context::ContextSequence;
use crate::model::diagnostics::{alignment_diagonality, alignment_peaks};
use crate::model::tacotron2::{Conditioning, Tacotron2, Tacotron2Output};
use crate::{Error, Result};

/// Maps token ids to a context sequence.
pub trait SequenceEncoder: Send + Sync {
    /// Output width `D_enc`.
    fn dim(&self) -> usize;

    fn encode(&self, tokens: &[u32]) -> Result<ContextSequence>;
}

/// Plain embedding lookup; the simplest possible [`SequenceEncoder`].
#[derive(Debug, Clone)]
pub struct EmbeddingEncoder {
    embedding: Embedding,
    vocab_size: usize,
    dim: usize,
}

impl EmbeddingEncoder {
    pub fn new(vocab_size: usize, dim: usize, vb: VarBuilder) -> Result<Self> {
        let embedding = candle_nn::embedding(vocab_size, dim, vb.pp("embedding"))?;
        Ok(Self {
            embedding,
            vocab_size,
            dim,
        })
    }
}

impl SequenceEncoder for EmbeddingEncoder {
    fn dim(&self) -> usize {
        self.dim
    }

    fn encode(&self, tokens: &[u32]) -> Result<ContextSequence> {
        if tokens.is_empty() {
            return Err(Error::EmptyContext);
        }
        if let Some(bad) = tokens.iter().find(|&&t| t as usize >= self.vocab_size) {
            return Err(Error::Input(format!(
                "token {bad} out of range for vocabulary of {}",
                self.vocab_size
            )));
        }
        let ids = Tensor::new(tokens, self.embedding.embeddings().device())?;
        let values = self.embedding.forward(&ids)?;
        ContextSequence::with_length(&values, tokens.len())
    }
}

/// One utterance to synthesize.
#[derive(Debug, Clone)]
pub struct SynthesisRequest {
    pub tokens: Vec<u32>,
    pub conditioning: Conditioning,
    /// Seed for prenet dropout; `None` uses candle's thread RNG.
    pub seed: Option<u64>,
}

impl SynthesisRequest {
    pub fn new(tokens: Vec<u32>) -> Self {
        Self {
            tokens,
            conditioning: Conditioning::default(),
            seed: None,
        }
    }

    pub fn with_conditioning(mut self, conditioning: Conditioning) -> Self {
        self.conditioning = conditioning;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// Encoder plus decoder stack.
pub struct Synthesizer<E> {
    encoder: E,
    model: Tacotron2,
}

impl<E: SequenceEncoder> Synthesizer<E> {
    pub fn new(encoder: E, config: &Tacotron2Config, vb: VarBuilder) -> Result<Self> {
        let model = Tacotron2::new(config, vb.pp("decoder_stack"))?;
        Self::from_parts(encoder, model)
    }

    pub fn from_parts(encoder: E, model: Tacotron2) -> Result<Self> {
        if encoder.dim() != model.config().encoder_dim {
            return Err(Error::Config(format!(
                "encoder width {} does not match encoder_dim {}",
                encoder.dim(),
                model.config().encoder_dim
            )));
        }
        Ok(Self { encoder, model })
    }

    pub fn model(&self) -> &Tacotron2 {
        &self.model
    }

    /// Free-running synthesis of one utterance.
    pub fn synthesize(&self, request: &SynthesisRequest) -> Result<Tacotron2Output> {
        let ctx = self.encoder.encode(&request.tokens)?;
        let out = self
            .model
            .inference(&ctx, &request.conditioning, request.seed)?;
        let diagonality = alignment_diagonality(&out.decoder.step_alignments)?;
        let final_peak = alignment_peaks(&out.decoder.step_alignments)?.last().copied();
        tracing::debug!(
            tokens = request.tokens.len(),
            frames = out.frames.dim(0)?,
            diagonality,
            final_peak,
            termination = ?out.decoder.termination,
            "utterance synthesized"
        );
        Ok(out)
    }

    /// Teacher-forced synthesis against `target` (`[N, frame_dim]`).
    pub fn synthesize_teacher_forced(
        &self,
        request: &SynthesisRequest,
        target: &Tensor,
    ) -> Result<Tacotron2Output> {
        let ctx = self.encoder.encode(&request.tokens)?;
        self.model
            .teacher_forced(&ctx, &request.conditioning, target, request.seed)
    }
}

/// Runs synthesis requests on tokio's blocking pool.
pub struct DecodeManager<E> {
    synthesizer: Arc<Synthesizer<E>>,
}

impl<E> Clone for DecodeManager<E> {
    fn clone(&self) -> Self {
        Self {
            synthesizer: Arc::clone(&self.synthesizer),
        }
    }
}

impl<E: SequenceEncoder + 'static> DecodeManager<E> {
    pub fn new(synthesizer: Synthesizer<E>) -> Self {
        Self {
            synthesizer: Arc::new(synthesizer),
        }
    }

    pub fn synthesizer(&self) -> &Synthesizer<E> {
        &self.synthesizer
    }

    /// Synthesize one utterance on a blocking worker.
    pub async fn synthesize(&self, request: SynthesisRequest) -> Result<Tacotron2Output> {
        let synthesizer = Arc::clone(&self.synthesizer);
        tokio::task::spawn_blocking(move || synthesizer.synthesize(&request))
            .await
            .map_err(|join_error| Error::Worker(format!("decode task failed: {join_error}")))?
    }

    /// Synthesize independent utterances concurrently. Results keep request order.
    pub async fn synthesize_batch(
        &self,
        requests: Vec<SynthesisRequest>,
    ) -> Vec<Result<Tacotron2Output>> {
        let count = requests.len();
        tracing::info!(count, "decode batch started");
        let handles: Vec<_> = requests
            .into_iter()
            .map(|request| {
                let synthesizer = Arc::clone(&self.synthesizer);
                tokio::task::spawn_blocking(move || synthesizer.synthesize(&request))
            })
            .collect();

        let mut results = Vec::with_capacity(count);
        for handle in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(join_error) => Err(Error::Worker(format!("decode task failed: {join_error}"))),
            };
            results.push(result);
        }
        let failed = results.iter().filter(|r| r.is_err()).count();
        tracing::info!(count, failed, "decode batch finished");
        results
    }
}
