//! Configuration for the Tacotron2 decoder stack.
//!
//! Defaults follow the usual multi-style GST setup (80 mel bins, 512-wide
//! encoder, 1024-wide recurrent cells). Every field is fixed per model
//! instance; nothing here changes between calls.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Alignment policy used by the attention module.
///
/// `Windowed` wraps any of the other policies and restricts scoring to a
/// sliding window around the previous step's alignment peak.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AttentionPolicy {
    /// Content + location-sensitive additive attention.
    LocationSensitive,
    /// Forward attention with a fixed transition probability of 0.5.
    Forward,
    /// Forward attention with a learned per-step transition agent.
    ForwardTransitionAgent,
    /// Sliding-window wrapper around another policy.
    Windowed {
        inner: Box<AttentionPolicy>,
        half_width: usize,
    },
}

impl AttentionPolicy {
    /// The policy with any window wrapper removed.
    pub fn base(&self) -> &AttentionPolicy {
        match self {
            AttentionPolicy::Windowed { inner, .. } => inner.base(),
            other => other,
        }
    }

    /// Window half-width, if this policy is windowed.
    pub fn window(&self) -> Option<usize> {
        match self {
            AttentionPolicy::Windowed { half_width, .. } => Some(*half_width),
            _ => None,
        }
    }

    /// Whether the base policy is one of the forward-attention variants.
    pub fn is_forward(&self) -> bool {
        matches!(
            self.base(),
            AttentionPolicy::Forward | AttentionPolicy::ForwardTransitionAgent
        )
    }
}

/// How attention energies are turned into a distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
    Softmax,
    /// Independent sigmoid per position, then renormalized to sum to one.
    Sigmoid,
}

/// Prenet layer flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrenetKind {
    /// Linear → ReLU → dropout.
    Original,
    /// Linear → BatchNorm → ReLU → dropout.
    BatchNorm,
}

/// Attention module configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttentionConfig {
    pub policy: AttentionPolicy,
    pub normalization: Normalization,
    /// Width of the additive scoring space.
    pub attention_dim: usize,
    /// Number of filters in the location convolution.
    pub location_filters: usize,
    /// Kernel size of the location convolution (odd).
    pub location_kernel_size: usize,
    /// Feed cumulative alignment features into the scorer.
    pub location_features: bool,
    /// Prune forward-attention mass far from the previous peak at inference.
    pub forward_mask: bool,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            policy: AttentionPolicy::LocationSensitive,
            normalization: Normalization::Softmax,
            attention_dim: 128,
            location_filters: 32,
            location_kernel_size: 31,
            location_features: true,
            forward_mask: false,
        }
    }
}

/// Autoregressive decoder configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Acoustic frame width (mel bins).
    pub frame_dim: usize,
    /// Frames emitted per decoder step (`r`).
    pub frames_per_step: usize,
    pub prenet_dims: Vec<usize>,
    pub prenet_kind: PrenetKind,
    /// Keep prenet dropout active, including at inference.
    pub prenet_dropout: bool,
    pub prenet_dropout_p: f32,
    /// Hidden width of the attention (query) LSTM cell.
    pub query_dim: usize,
    /// Hidden width of the decoder LSTM cell.
    pub decoder_rnn_dim: usize,
    /// Hard upper bound on free-running decoder steps.
    pub max_decoder_steps: usize,
    /// Stop probability that must be exceeded on two consecutive steps.
    pub stop_threshold: f32,
    /// Stop projection reads a detached copy of its input.
    pub separate_stopnet: bool,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            frame_dim: 80,
            frames_per_step: 1,
            prenet_dims: vec![256, 256],
            prenet_kind: PrenetKind::Original,
            prenet_dropout: true,
            prenet_dropout_p: 0.5,
            query_dim: 1024,
            decoder_rnn_dim: 1024,
            max_decoder_steps: 500,
            stop_threshold: 0.5,
            separate_stopnet: true,
        }
    }
}

/// Postnet configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostnetConfig {
    pub channels: usize,
    pub kernel_size: usize,
    pub num_convs: usize,
}

impl Default for PostnetConfig {
    fn default() -> Self {
        Self {
            channels: 512,
            kernel_size: 5,
            num_convs: 5,
        }
    }
}

/// Global style token configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StyleConfig {
    /// Number of learned style tokens `K`.
    pub num_tokens: usize,
    /// Width of each token and of the resulting style vector.
    pub embedding_dim: usize,
    pub num_heads: usize,
    /// Output channels of the reference encoder's stride-2 conv stack.
    pub reference_filters: Vec<usize>,
    /// Mel bins of the reference spectrogram.
    pub num_mel: usize,
}

impl Default for StyleConfig {
    fn default() -> Self {
        Self {
            num_tokens: 10,
            embedding_dim: 256,
            num_heads: 4,
            reference_filters: vec![32, 32, 64, 64, 128, 128],
            num_mel: 80,
        }
    }
}

/// Top-level model configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tacotron2Config {
    /// Width of the sequence encoder output.
    pub encoder_dim: usize,
    /// Number of speakers; a speaker table exists only when > 1.
    pub num_speakers: usize,
    pub speaker_embedding_dim: usize,
    /// GST layer; `None` disables style conditioning.
    pub style: Option<StyleConfig>,
    pub attention: AttentionConfig,
    pub decoder: DecoderConfig,
    pub postnet: PostnetConfig,
    /// Build a second decoder for the time-reversed consistency pass.
    pub bidirectional_decoder: bool,
}

impl Default for Tacotron2Config {
    fn default() -> Self {
        Self {
            encoder_dim: 512,
            num_speakers: 1,
            speaker_embedding_dim: 512,
            style: None,
            attention: AttentionConfig::default(),
            decoder: DecoderConfig::default(),
            postnet: PostnetConfig::default(),
            bidirectional_decoder: false,
        }
    }
}

/// What conditioning a model instance accepts. Fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub has_speaker_conditioning: bool,
    pub has_style_conditioning: bool,
    pub has_backward_decoder: bool,
}

impl Tacotron2Config {
    /// Parse a JSON config. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read and parse a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            has_speaker_conditioning: self.num_speakers > 1,
            has_style_conditioning: self.style.is_some(),
            has_backward_decoder: self.bidirectional_decoder,
        }
    }

    /// Width of the conditioned context: encoder ‖ style ‖ speaker.
    pub fn context_dim(&self) -> usize {
        let caps = self.capabilities();
        let mut dim = self.encoder_dim;
        if let Some(style) = &self.style {
            dim += style.embedding_dim;
        }
        if caps.has_speaker_conditioning {
            dim += self.speaker_embedding_dim;
        }
        dim
    }

    /// Check cross-field invariants.
    pub fn validate(&self) -> Result<()> {
        let dec = &self.decoder;
        if dec.frames_per_step == 0 {
            return Err(Error::Config("frames_per_step must be at least 1".into()));
        }
        if dec.max_decoder_steps == 0 {
            return Err(Error::Config("max_decoder_steps must be at least 1".into()));
        }
        if !(0.0..1.0).contains(&dec.stop_threshold) {
            return Err(Error::Config(format!(
                "stop_threshold must be in [0, 1), got {}",
                dec.stop_threshold
            )));
        }
        if !(0.0..1.0).contains(&dec.prenet_dropout_p) {
            return Err(Error::Config(format!(
                "prenet_dropout_p must be in [0, 1), got {}",
                dec.prenet_dropout_p
            )));
        }
        if dec.prenet_dims.is_empty() {
            return Err(Error::Config("prenet_dims must not be empty".into()));
        }

        let attn = &self.attention;
        if attn.location_kernel_size % 2 == 0 {
            return Err(Error::Config(format!(
                "location_kernel_size must be odd, got {}",
                attn.location_kernel_size
            )));
        }
        if let AttentionPolicy::Windowed { inner, .. } = &attn.policy
            && inner.window().is_some()
        {
            return Err(Error::Config("windowed attention cannot be nested".into()));
        }
        // A single-position window masks out the shifted path mass every step.
        if attn.policy.window() == Some(0) && attn.policy.is_forward() {
            return Err(Error::Config(
                "windowed forward attention needs half_width of at least 1".into(),
            ));
        }

        if self.postnet.kernel_size % 2 == 0 || self.postnet.num_convs < 2 {
            return Err(Error::Config(
                "postnet needs an odd kernel and at least two convolutions".into(),
            ));
        }

        if let Some(style) = &self.style {
            if style.num_heads == 0 || style.embedding_dim % style.num_heads != 0 {
                return Err(Error::Config(format!(
                    "style embedding_dim {} is not divisible by num_heads {}",
                    style.embedding_dim, style.num_heads
                )));
            }
            if style.embedding_dim % 2 != 0 || style.reference_filters.is_empty() {
                return Err(Error::Config(
                    "style embedding_dim must be even and reference_filters non-empty".into(),
                ));
            }
        }
        Ok(())
    }
}
