//! Tacotron2-style spectrogram decoder in pure Rust.
//!
//! A candle-based implementation of the autoregressive attention decoder
//! from Tacotron2, with location-sensitive, forward and windowed attention,
//! a stop-token predictor, a residual postnet, global style tokens and an
//! optional time-reversed consistency decoder.
//!
//! ## Architecture
//!
//! ```text
//! tokens → SequenceEncoder ──┐
//! reference mel → GST ───────┼→ conditioned context (encoder ‖ style ‖ speaker)
//! speaker id → embedding ────┘
//!                             ↓
//!         prenet → attention LSTM → attention → decoder LSTM   (one step, looped)
//!                             ↓                       ↓
//!                      frames (r per step)      stop logit
//!                             ↓
//!                      postnet residual → final frames
//! ```
//!
//! ## Modules
//!
//! - [`config`] — serde configuration and capability descriptor
//! - [`context`] — encoder context sequence with validity mask
//! - [`model`] — attention, decoder, postnet, style tokens, full stack
//! - [`pipeline`] — encoder seam, synthesizer, parallel decode manager

pub mod config;
pub mod context;
pub mod model;
pub mod pipeline;

mod error;

pub use error::{Error, Result};
