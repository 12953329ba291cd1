//! Haiku Compute - kernel backends for layer evaluation
//!
//! This crate is the only place that talks to a compute API. Layers describe
//! their work as [`Invocation`]s (a named kernel, ordered buffer bindings, a
//! packed parameter record and a dispatch width) and a [`ComputeBackend`]
//! runs them.
//!
//! # Backends
//!
//! - [`GpuBackend`]: WGSL kernels dispatched through wgpu
//! - [`ReferenceBackend`]: the same kernels evaluated on the CPU, one loop
//!   iteration per GPU thread, used for verification and tests
//!
//! # Dispatch model
//!
//! ```text
//! Invocation[] → dispatch() → Completion → wait()
//!                   │
//!                   └─ one in-order queue: kernel N+1 observes all writes of kernel N
//! ```
//!
//! Buffers are addressed by [`BufferId`] handles owned by the backend.
//! Several invocations may bind the same handle; that sharing is how one
//! layer's output becomes the next layer's input.

pub mod backend;
pub mod buffer;
pub mod error;
pub mod gpu;
pub mod invocation;
pub mod kernels;
pub mod math;
pub mod params;
pub mod reference;

// Re-exports
pub use backend::{ComputeBackend, Completion};
pub use buffer::BufferId;
pub use error::{ComputeError, Result};
pub use gpu::{GpuBackend, GpuConfig, GpuContext};
pub use invocation::{Binding, BufferRole, Invocation};
pub use kernels::{Access, KernelHandle, KernelSignature, WORKGROUP_SIZE};
pub use params::{ElementwiseParams, KernelParams, LinearParams, LstmParams};
pub use reference::{DispatchRecord, DispatchTrace, ReferenceBackend};

/// Shader source code
pub mod shaders {
    pub const COMMON: &str = include_str!("shaders/common.wgsl");
    pub const ACTIVATION_FORWARD: &str = include_str!("shaders/activation_forward.wgsl");
    pub const ACTIVATION_BACKWARD: &str = include_str!("shaders/activation_backward.wgsl");
    pub const LINEAR_FORWARD: &str = include_str!("shaders/linear_forward.wgsl");
    pub const LINEAR_BACKWARD: &str = include_str!("shaders/linear_backward.wgsl");
    pub const LSTM_FORWARD: &str = include_str!("shaders/lstm_forward.wgsl");
    pub const SOFTMAX_FORWARD: &str = include_str!("shaders/softmax_forward.wgsl");
    pub const BUFFER_COPY: &str = include_str!("shaders/buffer_copy.wgsl");
}
