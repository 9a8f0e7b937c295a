//! Error types for RustMuGen.

use thiserror::Error;

/// Main error type for multimodal generation.
#[derive(Error, Debug)]
pub enum MmError {
    /// Audio processing errors.
    #[error("Audio error: {0}")]
    Audio(String),

    /// Model construction errors.
    #[error("Model error: {0}")]
    Model(String),

    /// Inference errors.
    #[error("Inference error: {0}")]
    Inference(String),

    /// Configuration errors. Always fatal at construction time.
    #[error("Config error: {0}")]
    Config(String),

    /// Reserved-token collisions and other vocabulary inconsistencies.
    #[error("Vocabulary error: {0}")]
    Vocabulary(String),

    /// Bad or partially-consistent checkpoints.
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Inconsistent training batches.
    #[error("Data pipeline error: {0}")]
    DataPipeline(String),

    /// Malformed inline media markup in a prompt.
    #[error("Prompt error: {0}")]
    Prompt(String),

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Candle tensor errors.
    #[error("Tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    /// JSON parsing errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for multimodal operations.
pub type MmResult<T> = Result<T, MmError>;
