//! Error types for layer graphs

use haiku_compute::{BufferId, BufferRole, ComputeError};
use thiserror::Error;

/// Engine errors
#[derive(Debug, Error)]
pub enum EngineError {
    /// Backend failure
    #[error(transparent)]
    Compute(#[from] ComputeError),

    /// Consecutive layers disagree on size
    #[error("Shape mismatch at layer {layer}: expected input size {expected}, got {actual}")]
    ShapeMismatch {
        layer: usize,
        expected: usize,
        actual: usize,
    },

    /// Layer declared with a zero input or output size
    #[error("Layer {layer} has zero size")]
    ZeroSize { layer: usize },

    /// Host weight data does not match the layer shape
    #[error("Wrong {what} length: expected {expected}, got {actual}")]
    WeightLength {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Layer kind has no backward kernel
    #[error("Backward pass is not supported for {0} layers")]
    BackwardUnsupported(&'static str),

    /// Evaluation or transfer attempted before initialization
    #[error("Network is not initialized for this pass")]
    NotInitialized,

    /// Backward initialized with a different batch size than forward
    #[error("Batch size mismatch: forward uses {forward}, backward requested {backward}")]
    BatchSizeMismatch { forward: usize, backward: usize },

    #[error("Batch size must be at least 1")]
    InvalidBatchSize,

    /// Bound buffer is shorter than its role needs
    #[error("Buffer for {role:?} too small: need {required}, have {actual}")]
    BufferTooSmall {
        role: BufferRole,
        required: usize,
        actual: usize,
    },

    /// Binding list does not match the kernel signature
    #[error("Kernel '{kernel}' takes {expected} buffers, got {actual}")]
    BindingCount {
        kernel: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Parameter record does not match the kernel signature
    #[error("Kernel '{kernel}' takes {expected} parameter bytes, got {actual}")]
    ParameterSize {
        kernel: &'static str,
        expected: usize,
        actual: usize,
    },

    /// A writable binding shares its buffer with another binding
    #[error("Kernel '{kernel}' writes {buffer} while it is bound twice")]
    AliasedWrite {
        kernel: &'static str,
        buffer: BufferId,
    },

    /// Width is zero or above the backend's limit
    #[error("Invalid dispatch width {width} for '{kernel}' (limit {limit})")]
    InvalidDispatch {
        kernel: &'static str,
        width: usize,
        limit: usize,
    },

    #[error("Network has no layers")]
    EmptyNetwork,

    /// Buffer handle is not live on the backend
    #[error("Missing buffer {0}")]
    MissingBuffer(BufferId),
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
