//! Haiku Engine - layer graphs evaluated as kernel invocations
//!
//! A [`Network`] is an ordered chain of [`Layer`]s. Initialization turns
//! every layer into a cached list of [`Invocation`]s with explicit buffer
//! wiring; evaluation replays those invocations on a compute backend.
//!
//! # Buffer wiring
//!
//! ```text
//! boundary 0 ──▶ [layer 0] ──▶ boundary 1 ──▶ [layer 1] ──▶ boundary 2
//!    input                                                    output
//! ```
//!
//! One buffer handle sits on each boundary. A layer binds the boundary on
//! its left as input and the one on its right as output, so the next layer
//! reads exactly the buffer the previous one wrote. Backward passes use a
//! parallel chain of delta buffers, walked right to left.
//!
//! Layers never talk to the backend. They describe what they need through
//! a [`ForwardInvocationBuilder`] or [`BackwardInvocationBuilder`], which
//! validate it against the kernel registry.
//!
//! [`Invocation`]: haiku_compute::Invocation

pub mod builder;
pub mod error;
pub mod layer;
pub mod layers;
pub mod network;

// Re-exports
pub use builder::{BackwardInvocationBuilder, ForwardInvocationBuilder};
pub use error::{EngineError, Result};
pub use layer::{Layer, LayerKind};
pub use layers::{Activation, ActivationFunction, Linear, Lstm, Softmax};
pub use network::{Network, NetworkBuilder};
