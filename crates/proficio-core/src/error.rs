//! Error types for proficio

use thiserror::Error;

/// Core proficio errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FusionError {
    // Construction errors
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    // Input errors
    #[error("Invalid view count: {present} present in {slots} slots, at most {max} allowed")]
    ViewCount {
        present: usize,
        slots: usize,
        max: usize,
    },

    #[error("Dimension mismatch in {context}: expected {expected}, got {actual}")]
    DimensionMismatch {
        context: String,
        expected: usize,
        actual: usize,
    },

    // Numeric errors
    #[error("Non-finite value in {stage} at index {index}")]
    NumericInstability { stage: &'static str, index: usize },

    // Checkpoint errors
    #[error("Buffer too short: expected {expected}, got {actual}")]
    BufferTooShort { expected: usize, actual: usize },

    #[error("Invalid checkpoint: {0}")]
    InvalidCheckpoint(String),

    #[error("Checkpoint checksum mismatch")]
    ChecksumMismatch,

    #[error("Missing tensor: {0}")]
    MissingTensor(String),

    #[error("Tensor {name} has shape {actual:?}, expected {expected:?}")]
    TensorShape {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    // Environment errors
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl FusionError {
    /// Shorthand for a dimension mismatch
    pub fn dimension(context: impl Into<String>, expected: usize, actual: usize) -> Self {
        FusionError::DimensionMismatch {
            context: context.into(),
            expected,
            actual,
        }
    }

    /// Caller/integration bugs that must never be retried
    pub fn is_fatal(&self) -> bool {
        !matches!(self, FusionError::NumericInstability { .. })
    }
}

impl From<std::io::Error> for FusionError {
    fn from(err: std::io::Error) -> Self {
        FusionError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for FusionError {
    fn from(err: serde_json::Error) -> Self {
        FusionError::Serialization(err.to_string())
    }
}

/// Result type for proficio operations
pub type FusionResult<T> = Result<T, FusionError>;
