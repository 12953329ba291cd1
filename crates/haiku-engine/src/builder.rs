//! Invocation builders
//!
//! The only path from a layer to the compute backend. A layer asks for the
//! buffers it needs by role and hands back a kernel name, the buffers in
//! binding order, a parameter record and a width; the builder checks all
//! of it against the kernel registry before producing an [`Invocation`].
//!
//! Every bound buffer must be at least as long as both the layer boundary
//! and the parameter record require.

use haiku_compute::{Binding, BufferId, BufferRole, ComputeBackend, Invocation, KernelParams};
use tracing::debug;

use crate::{EngineError, Result};

/// State shared by forward and backward builders
struct BuilderCore<'a> {
    backend: &'a mut dyn ComputeBackend,
    owned: &'a mut Vec<BufferId>,
    batch_size: usize,
    input_size: usize,
    output_size: usize,
}

impl BuilderCore<'_> {
    /// Minimum length the layer boundaries give a buffer bound with `role`
    ///
    /// Parameter and state buffers are interior to the layer; their length
    /// comes from the parameter record instead.
    fn boundary_len(&self, role: BufferRole) -> Option<usize> {
        match role {
            BufferRole::Input | BufferRole::InputDeltas => Some(self.batch_size * self.input_size),
            BufferRole::Output | BufferRole::OutputDeltas => {
                Some(self.batch_size * self.output_size)
            }
            BufferRole::Weights | BufferRole::Biases | BufferRole::State | BufferRole::NextState => {
                None
            }
        }
    }

    fn allocate(&mut self, len: usize) -> Result<BufferId> {
        let id = self.backend.allocate_buffer(len)?;
        self.owned.push(id);
        Ok(id)
    }

    fn create_invocation<P: KernelParams>(
        &mut self,
        kernel: &str,
        buffers: &[(BufferRole, BufferId)],
        params: &P,
        width: usize,
    ) -> Result<Invocation> {
        let handle = self.backend.resolve_kernel(kernel)?;
        let signature = handle.signature();

        if buffers.len() != signature.bindings.len() {
            return Err(EngineError::BindingCount {
                kernel: signature.name,
                expected: signature.bindings.len(),
                actual: buffers.len(),
            });
        }

        let packed = bytemuck::bytes_of(params);
        if packed.len() != signature.params_size {
            return Err(EngineError::ParameterSize {
                kernel: signature.name,
                expected: signature.params_size,
                actual: packed.len(),
            });
        }

        let limit = self.backend.max_dispatch_width();
        if width == 0 || width > limit {
            return Err(EngineError::InvalidDispatch {
                kernel: signature.name,
                width,
                limit,
            });
        }

        let mut bindings = Vec::with_capacity(buffers.len());
        for (slot, (&(role, buffer), &access)) in
            buffers.iter().zip(signature.bindings).enumerate()
        {
            let actual = self
                .backend
                .buffer_len(buffer)
                .ok_or(EngineError::MissingBuffer(buffer))?;
            let required = self
                .boundary_len(role)
                .into_iter()
                .chain(params.required_len(role))
                .max();
            if let Some(required) = required {
                if actual < required {
                    return Err(EngineError::BufferTooSmall {
                        role,
                        required,
                        actual,
                    });
                }
            }

            let aliased = buffers
                .iter()
                .enumerate()
                .any(|(other, &(_, id))| other != slot && id == buffer);
            if access.is_writable() && aliased {
                return Err(EngineError::AliasedWrite {
                    kernel: signature.name,
                    buffer,
                });
            }

            bindings.push(Binding {
                buffer,
                role,
                access,
            });
        }

        debug!(kernel = signature.name, width, "Created invocation");
        Ok(Invocation::new(handle, bindings, packed.to_vec(), width))
    }
}

/// Builder handed to [`Layer::initialize_forward`](crate::Layer::initialize_forward)
pub struct ForwardInvocationBuilder<'a> {
    core: BuilderCore<'a>,
    input: BufferId,
    output: BufferId,
}

impl<'a> ForwardInvocationBuilder<'a> {
    /// Builder for one layer whose boundaries are `input` and `output`
    ///
    /// Buffers allocated through the builder are appended to `owned`.
    pub fn new(
        backend: &'a mut dyn ComputeBackend,
        owned: &'a mut Vec<BufferId>,
        batch_size: usize,
        (input_size, output_size): (usize, usize),
        input: BufferId,
        output: BufferId,
    ) -> Self {
        Self {
            core: BuilderCore {
                backend,
                owned,
                batch_size,
                input_size,
                output_size,
            },
            input,
            output,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.core.batch_size
    }

    pub fn input_buffer(&self) -> BufferId {
        self.input
    }

    pub fn output_buffer(&self) -> BufferId {
        self.output
    }

    /// Allocate a buffer and upload trained values into it
    pub fn parameter_buffer(&mut self, role: BufferRole, values: &[f32]) -> Result<BufferId> {
        let id = self.core.allocate(values.len())?;
        self.core.backend.write_buffer(id, values)?;
        debug!(buffer = %id, ?role, len = values.len(), "Uploaded parameters");
        Ok(id)
    }

    /// Allocate a zeroed buffer of `len` floats
    pub fn state_buffer(&mut self, len: usize) -> Result<BufferId> {
        self.core.allocate(len)
    }

    pub fn create_invocation<P: KernelParams>(
        &mut self,
        kernel: &str,
        buffers: &[(BufferRole, BufferId)],
        params: &P,
        width: usize,
    ) -> Result<Invocation> {
        self.core.create_invocation(kernel, buffers, params, width)
    }
}

/// Builder handed to [`Layer::initialize_backward`](crate::Layer::initialize_backward)
pub struct BackwardInvocationBuilder<'a> {
    core: BuilderCore<'a>,
    output_deltas: BufferId,
    input: BufferId,
    input_deltas: BufferId,
}

impl<'a> BackwardInvocationBuilder<'a> {
    pub fn new(
        backend: &'a mut dyn ComputeBackend,
        owned: &'a mut Vec<BufferId>,
        batch_size: usize,
        (input_size, output_size): (usize, usize),
        output_deltas: BufferId,
        input: BufferId,
        input_deltas: BufferId,
    ) -> Self {
        Self {
            core: BuilderCore {
                backend,
                owned,
                batch_size,
                input_size,
                output_size,
            },
            output_deltas,
            input,
            input_deltas,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.core.batch_size
    }

    /// Gradient arriving from the next layer
    pub fn output_deltas_buffer(&self) -> BufferId {
        self.output_deltas
    }

    /// The forward input of this layer
    pub fn input_buffer(&self) -> BufferId {
        self.input
    }

    /// Gradient this layer produces for the previous one
    pub fn input_deltas_buffer(&self) -> BufferId {
        self.input_deltas
    }

    pub fn create_invocation<P: KernelParams>(
        &mut self,
        kernel: &str,
        buffers: &[(BufferRole, BufferId)],
        params: &P,
        width: usize,
    ) -> Result<Invocation> {
        self.core.create_invocation(kernel, buffers, params, width)
    }
}
