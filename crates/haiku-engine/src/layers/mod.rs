//! Concrete layer kinds
//!
//! Each kind only decides which kernels to run and how to pack their
//! parameters; buffer wiring comes from the builders.

mod activation;
mod linear;
mod lstm;
mod softmax;

pub use activation::{Activation, ActivationFunction};
pub use linear::Linear;
pub use lstm::Lstm;
pub use softmax::Softmax;
