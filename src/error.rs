//! Error types for tacotron2-rs.

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Candle tensor/model error.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// Invalid configuration.
    #[error("config: {0}")]
    Config(String),

    /// Speaker or style conditioning does not match the model's capabilities.
    #[error("conditioning: {0}")]
    Conditioning(String),

    /// The context sequence has no valid (unpadded) position.
    #[error("context sequence has no valid positions (mask sum is zero)")]
    EmptyContext,

    /// Alignment normalization produced a zero or non-finite sum.
    #[error("alignment: {0}")]
    Alignment(String),

    /// A resumable decode can no longer make progress.
    #[error("decode session: {0}")]
    Session(String),

    /// Caller-provided tensor has the wrong shape.
    #[error("input: {0}")]
    Input(String),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// A parallel decode task failed to complete.
    #[error("worker: {0}")]
    Worker(String),
}
