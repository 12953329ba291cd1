//! Kernel registry
//!
//! Every kernel the engine can dispatch is declared here once: its name
//! (which is also the WGSL entry point), the module it lives in, the access
//! mode of each storage binding in order, and the byte size of its
//! parameter record. Binding 0 is always the parameter uniform; storage
//! bindings start at 1.

use std::fmt;
use std::mem::size_of;

use crate::params::{ElementwiseParams, LinearParams, LstmParams};
use crate::shaders;

/// Threads per workgroup used by every kernel
pub const WORKGROUP_SIZE: u32 = 64;

/// Access mode of a storage binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    ReadWrite,
}

impl Access {
    pub fn is_writable(self) -> bool {
        matches!(self, Access::ReadWrite)
    }
}

/// Static description of a kernel's interface
#[derive(Debug)]
pub struct KernelSignature {
    /// Kernel name and WGSL entry point
    pub name: &'static str,
    /// WGSL module source (without the shared helpers)
    pub source: &'static str,
    /// Storage bindings in binding order
    pub bindings: &'static [Access],
    /// Size of the parameter record in bytes
    pub params_size: usize,
}

const ELEMENTWISE: usize = size_of::<ElementwiseParams>();
const LINEAR: usize = size_of::<LinearParams>();
const LSTM: usize = size_of::<LstmParams>();

const UNARY: &[Access] = &[Access::Read, Access::ReadWrite];
const UNARY_BACKWARD: &[Access] = &[Access::Read, Access::Read, Access::ReadWrite];

/// All kernels known to the backends
pub static KERNELS: &[KernelSignature] = &[
    KernelSignature {
        name: "sigmoid_forward",
        source: shaders::ACTIVATION_FORWARD,
        bindings: UNARY,
        params_size: ELEMENTWISE,
    },
    KernelSignature {
        name: "sigmoid_backward",
        source: shaders::ACTIVATION_BACKWARD,
        bindings: UNARY_BACKWARD,
        params_size: ELEMENTWISE,
    },
    KernelSignature {
        name: "tanh_forward",
        source: shaders::ACTIVATION_FORWARD,
        bindings: UNARY,
        params_size: ELEMENTWISE,
    },
    KernelSignature {
        name: "tanh_backward",
        source: shaders::ACTIVATION_BACKWARD,
        bindings: UNARY_BACKWARD,
        params_size: ELEMENTWISE,
    },
    KernelSignature {
        name: "relu_forward",
        source: shaders::ACTIVATION_FORWARD,
        bindings: UNARY,
        params_size: ELEMENTWISE,
    },
    KernelSignature {
        name: "relu_backward",
        source: shaders::ACTIVATION_BACKWARD,
        bindings: UNARY_BACKWARD,
        params_size: ELEMENTWISE,
    },
    // input, weights, biases, output
    KernelSignature {
        name: "linear_forward",
        source: shaders::LINEAR_FORWARD,
        bindings: &[Access::Read, Access::Read, Access::Read, Access::ReadWrite],
        params_size: LINEAR,
    },
    // output deltas, weights, input deltas
    KernelSignature {
        name: "linear_backward",
        source: shaders::LINEAR_BACKWARD,
        bindings: &[Access::Read, Access::Read, Access::ReadWrite],
        params_size: LINEAR,
    },
    // input, weights, biases, state, output, next state
    KernelSignature {
        name: "lstm_forward",
        source: shaders::LSTM_FORWARD,
        bindings: &[
            Access::Read,
            Access::Read,
            Access::Read,
            Access::Read,
            Access::ReadWrite,
            Access::ReadWrite,
        ],
        params_size: LSTM,
    },
    KernelSignature {
        name: "softmax_forward",
        source: shaders::SOFTMAX_FORWARD,
        bindings: UNARY,
        params_size: ELEMENTWISE,
    },
    KernelSignature {
        name: "buffer_copy",
        source: shaders::BUFFER_COPY,
        bindings: UNARY,
        params_size: ELEMENTWISE,
    },
];

/// Look up a kernel by name
pub fn lookup(name: &str) -> Option<&'static KernelSignature> {
    KERNELS.iter().find(|kernel| kernel.name == name)
}

/// A kernel resolved by a backend
///
/// Holding a handle means the backend has accepted the kernel (for the GPU
/// backend: compiled its pipeline).
#[derive(Clone, Copy)]
pub struct KernelHandle {
    signature: &'static KernelSignature,
}

impl KernelHandle {
    pub(crate) fn new(signature: &'static KernelSignature) -> Self {
        Self { signature }
    }

    pub fn name(&self) -> &'static str {
        self.signature.name
    }

    pub fn signature(&self) -> &'static KernelSignature {
        self.signature
    }
}

impl fmt::Debug for KernelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("KernelHandle").field(&self.signature.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_known_kernel() {
        let kernel = lookup("sigmoid_forward").unwrap();
        assert_eq!(kernel.bindings.len(), 2);
        assert_eq!(kernel.params_size, 16);
    }

    #[test]
    fn test_lookup_unknown_kernel() {
        assert!(lookup("sigmoid_sideways").is_none());
    }

    #[test]
    fn test_kernel_names_are_unique() {
        for (i, a) in KERNELS.iter().enumerate() {
            for b in &KERNELS[i + 1..] {
                assert_ne!(a.name, b.name);
            }
        }
    }

    #[test]
    fn test_every_kernel_writes_something() {
        for kernel in KERNELS {
            assert!(
                kernel.bindings.iter().any(|access| access.is_writable()),
                "{} writes nothing",
                kernel.name
            );
        }
    }

    #[test]
    fn test_entry_points_exist_in_source() {
        for kernel in KERNELS {
            let needle = format!("fn {}(", kernel.name);
            assert!(
                kernel.source.contains(&needle),
                "{} missing from its module",
                kernel.name
            );
        }
    }
}
