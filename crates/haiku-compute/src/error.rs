//! Error types for compute backends

use thiserror::Error;

use crate::BufferId;

/// Compute backend errors
#[derive(Debug, Error)]
pub enum ComputeError {
    /// No suitable GPU adapter found
    #[error("No suitable GPU adapter found")]
    NoAdapter,

    /// GPU device request failed
    #[error("GPU device request failed: {0}")]
    DeviceRequest(String),

    /// Shader compilation failed
    #[error("Shader compilation failed for '{kernel}': {message}")]
    ShaderCompile { kernel: String, message: String },

    /// Kernel name is not known to the backend
    #[error("Unknown kernel: {0}")]
    UnknownKernel(String),

    /// Buffer handle was released or never allocated
    #[error("Unknown buffer: {0}")]
    UnknownBuffer(BufferId),

    /// Zero-length allocations are not supported
    #[error("Cannot allocate an empty buffer")]
    EmptyBuffer,

    /// Host data does not match the buffer length
    #[error("Length mismatch for {buffer}: expected {expected}, got {actual}")]
    LengthMismatch {
        buffer: BufferId,
        expected: usize,
        actual: usize,
    },

    /// Buffer mapping failed
    #[error("Buffer mapping failed: {0}")]
    BufferMap(String),

    /// A submitted dispatch did not complete
    #[error("Dispatch failed: {0}")]
    DispatchFailed(String),

    /// Completion token does not belong to this backend or was already awaited
    #[error("Unknown completion token {0}")]
    UnknownCompletion(u64),
}

/// Result type for compute operations
pub type Result<T> = std::result::Result<T, ComputeError>;
