//! Error types for model loading and generation

use haiku_compute::ComputeError;
use haiku_engine::EngineError;
use thiserror::Error;

/// Errors reading trained weights
#[derive(Debug, Error)]
pub enum WeightError {
    /// Tensor is not present in the source
    #[error("Missing tensor: {0}")]
    Missing(String),

    /// Tensor exists with the wrong shape
    #[error("Tensor '{name}' has shape {actual:?}, expected {expected:?}")]
    Shape {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// File content is structurally invalid
    #[error("Malformed model file: {0}")]
    Malformed(String),

    /// Stored digest does not match the tensor data
    #[error("Model digest mismatch: file says {expected}, data hashes to {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("Unsupported model format version {0}")]
    UnsupportedVersion(u32),

    #[error("Model IO failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Model JSON invalid: {0}")]
    Json(#[from] serde_json::Error),
}

/// Poet errors
#[derive(Debug, Error)]
pub enum PoetError {
    /// Generation requested before a successful prepare
    #[error("Poet is not prepared")]
    NotPrepared,

    /// A generation run is already active
    #[error("Poet is already evaluating")]
    AlreadyEvaluating,

    #[error("Poet is already preparing")]
    AlreadyPreparing,

    /// Seed contains no symbol of the vocabulary
    #[error("Seed {0:?} contains no known symbols")]
    InvalidSeed(String),

    /// Model layers do not map the vocabulary back onto itself
    #[error("Model maps {expected} symbols to {actual} outputs")]
    VocabularyMismatch { expected: usize, actual: usize },

    #[error("Vocabulary is empty")]
    EmptyVocabulary,

    #[error("Vocabulary lists {0:?} twice")]
    DuplicateSymbol(char),

    /// Background worker panicked or was cancelled
    #[error("Worker failed: {0}")]
    WorkerFailed(String),

    #[error(transparent)]
    Weights(#[from] WeightError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Compute(#[from] ComputeError),
}

/// Result type for poet operations
pub type Result<T> = std::result::Result<T, PoetError>;
