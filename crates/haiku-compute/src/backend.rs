//! The compute backend seam

use crate::{BufferId, Invocation, KernelHandle, Result};

/// Token for a submitted batch of invocations
///
/// Must be passed to [`ComputeBackend::wait`] before reading buffers the
/// batch wrote.
#[must_use = "completions must be awaited before reading results"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion(u64);

impl Completion {
    pub(crate) fn new(sequence: u64) -> Self {
        Self(sequence)
    }

    pub fn sequence(self) -> u64 {
        self.0
    }
}

/// A device able to run registered kernels over backend-owned buffers
///
/// Invocations within one [`dispatch`](ComputeBackend::dispatch) call run
/// in slice order, each observing every write of the ones before it.
pub trait ComputeBackend: Send {
    /// Backend name for logging
    fn name(&self) -> &'static str;

    /// Resolve a kernel by name, compiling it if needed
    fn resolve_kernel(&mut self, name: &str) -> Result<KernelHandle>;

    /// Allocate a zero-filled buffer of `len` floats
    fn allocate_buffer(&mut self, len: usize) -> Result<BufferId>;

    /// Release a buffer; unknown handles are ignored
    fn release_buffer(&mut self, id: BufferId);

    /// Length in floats, or `None` if the handle is not live
    fn buffer_len(&self, id: BufferId) -> Option<usize>;

    /// Number of live buffers
    fn live_buffers(&self) -> usize;

    /// Overwrite a buffer's contents; `data` must match its length
    fn write_buffer(&mut self, id: BufferId, data: &[f32]) -> Result<()>;

    /// Copy a buffer's contents back to the host
    fn read_buffer(&mut self, id: BufferId) -> Result<Vec<f32>>;

    /// Largest dispatch width the backend accepts
    fn max_dispatch_width(&self) -> usize;

    /// Submit invocations in order
    fn dispatch(&mut self, invocations: &[&Invocation]) -> Result<Completion>;

    /// Block until a submission has finished
    fn wait(&mut self, completion: Completion) -> Result<()>;
}
