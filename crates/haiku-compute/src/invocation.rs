//! Scheduled kernel dispatches

use std::sync::atomic::{AtomicU64, Ordering};

use crate::{Access, BufferId, KernelHandle};

static NEXT_INVOCATION_ID: AtomicU64 = AtomicU64::new(1);

/// What a bound buffer means to the layer that bound it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferRole {
    /// Forward input activations
    Input,
    /// Forward output activations
    Output,
    /// Trained weight matrix
    Weights,
    /// Trained bias vector
    Biases,
    /// Recurrent state read by a step
    State,
    /// Recurrent state produced by a step
    NextState,
    /// Gradient with respect to the layer output
    OutputDeltas,
    /// Gradient with respect to the layer input
    InputDeltas,
}

/// One buffer bound to one kernel slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub buffer: BufferId,
    pub role: BufferRole,
    pub access: Access,
}

/// One scheduled dispatch of a kernel
///
/// Invocations reference buffers, they never own them.
#[derive(Debug, Clone)]
pub struct Invocation {
    id: u64,
    kernel: KernelHandle,
    bindings: Vec<Binding>,
    params: Vec<u8>,
    width: usize,
}

impl Invocation {
    /// Assemble an invocation
    ///
    /// No validation happens here; invocation builders check bindings,
    /// parameters and width before calling this.
    pub fn new(kernel: KernelHandle, bindings: Vec<Binding>, params: Vec<u8>, width: usize) -> Self {
        Self {
            id: NEXT_INVOCATION_ID.fetch_add(1, Ordering::Relaxed),
            kernel,
            bindings,
            params,
            width,
        }
    }

    /// Process-unique identity, used by backends to cache bind state
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kernel(&self) -> KernelHandle {
        self.kernel
    }

    pub fn kernel_name(&self) -> &'static str {
        self.kernel.name()
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    /// First buffer bound with the given role
    pub fn buffer(&self, role: BufferRole) -> Option<BufferId> {
        self.bindings
            .iter()
            .find(|binding| binding.role == role)
            .map(|binding| binding.buffer)
    }

    /// Packed parameter record
    pub fn params(&self) -> &[u8] {
        &self.params
    }

    /// Total number of threads (`size × batch_size`)
    pub fn width(&self) -> usize {
        self.width
    }

    /// Workgroups needed to cover the width
    pub fn workgroups(&self) -> u32 {
        self.width.div_ceil(crate::WORKGROUP_SIZE as usize) as u32
    }
}
