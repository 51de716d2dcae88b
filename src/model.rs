//! Neural components of the decoder stack.
//!
//! ## Components
//!
//! - [`attention`] — location-sensitive, forward and windowed alignment policies
//! - [`prenet`] — bottleneck over the previous frame, with reproducible dropout
//! - [`decoder`] — step function, teacher-forced and free-running loops
//! - [`stopnet`] — stop-token projection
//! - [`postnet`] — convolutional residual refinement
//! - [`style`] — reference encoder and global style token bank
//! - [`tacotron2`] — conditioning plus forward/backward decoders and postnet
//! - [`diagnostics`] — alignment health metrics

pub mod attention;
pub mod decoder;
pub mod diagnostics;
pub mod postnet;
pub mod prenet;
pub mod stopnet;
pub mod style;
pub mod tacotron2;
