//! CPU reference backend
//!
//! Runs every registered kernel on the host with the same indexing as the
//! WGSL sources: one loop iteration per GPU thread, reads observing the
//! buffer contents from before the dispatch. Used to verify layer wiring
//! and in tests; it is never picked automatically in place of a GPU.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::buffer::Slots;
use crate::kernels::{self, Access};
use crate::math::{sigmoid, stable_tanh};
use crate::params::{ElementwiseParams, LinearParams, LstmParams};
use crate::{BufferId, Completion, ComputeBackend, ComputeError, Invocation, KernelHandle, Result};

/// Width limit matching the default wgpu limits (65535 workgroups of 64)
const MAX_DISPATCH_WIDTH: usize = 65_535 * crate::WORKGROUP_SIZE as usize;

/// One executed invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRecord {
    pub kernel: &'static str,
    pub width: usize,
    pub buffers: Vec<BufferId>,
}

/// Shared log of executed invocations, in execution order
#[derive(Debug, Clone, Default)]
pub struct DispatchTrace {
    records: Arc<Mutex<Vec<DispatchRecord>>>,
}

impl DispatchTrace {
    fn push(&self, record: DispatchRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }

    /// Snapshot of all records
    pub fn records(&self) -> Vec<DispatchRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Kernel names in execution order
    pub fn kernel_names(&self) -> Vec<&'static str> {
        self.records().iter().map(|record| record.kernel).collect()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Arguments handed to a reference kernel
///
/// `reads` and `writes` follow binding order within their access class.
struct KernelCall<'a> {
    params: &'a [u8],
    width: usize,
    reads: Vec<Vec<f32>>,
    writes: Vec<Vec<f32>>,
}

impl KernelCall<'_> {
    fn params<P: bytemuck::Pod>(&self) -> P {
        bytemuck::pod_read_unaligned(self.params)
    }
}

type KernelFn = fn(&mut KernelCall<'_>);

/// CPU implementation of the compute backend
pub struct ReferenceBackend {
    buffers: Slots<Vec<f32>>,
    trace: DispatchTrace,
    submissions: u64,
}

impl ReferenceBackend {
    pub fn new() -> Self {
        Self {
            buffers: Slots::new(),
            trace: DispatchTrace::default(),
            submissions: 0,
        }
    }

    /// Handle to the dispatch log; stays valid after the backend is boxed
    pub fn trace(&self) -> DispatchTrace {
        self.trace.clone()
    }

    fn kernel_fn(name: &str) -> Option<KernelFn> {
        let kernel: KernelFn = match name {
            "sigmoid_forward" => |call| unary(call, sigmoid),
            "tanh_forward" => |call| unary(call, stable_tanh),
            "relu_forward" => |call| unary(call, |x| x.max(0.0)),
            "sigmoid_backward" => |call| {
                unary_backward(call, |dy, x| {
                    let s = sigmoid(x);
                    dy * s * (1.0 - s)
                })
            },
            "tanh_backward" => |call| {
                unary_backward(call, |dy, x| {
                    let t = stable_tanh(x);
                    dy * (1.0 - t * t)
                })
            },
            "relu_backward" => |call| unary_backward(call, |dy, x| if x > 0.0 { dy } else { 0.0 }),
            "linear_forward" => linear_forward,
            "linear_backward" => linear_backward,
            "lstm_forward" => lstm_forward,
            "softmax_forward" => softmax_forward,
            "buffer_copy" => |call| unary(call, |x| x),
            _ => return None,
        };
        Some(kernel)
    }

    fn run(&mut self, invocation: &Invocation) -> Result<()> {
        let name = invocation.kernel_name();
        let kernel =
            Self::kernel_fn(name).ok_or_else(|| ComputeError::UnknownKernel(name.to_string()))?;

        let mut reads = Vec::new();
        let mut writable = Vec::new();
        for binding in invocation.bindings() {
            let data = self
                .buffers
                .get(binding.buffer)
                .ok_or(ComputeError::UnknownBuffer(binding.buffer))?;
            match binding.access {
                Access::Read => reads.push(data.clone()),
                Access::ReadWrite => writable.push(binding.buffer),
            }
        }

        let mut writes = Vec::with_capacity(writable.len());
        for id in &writable {
            // Checked above; take() leaves an empty vec in the slot until restored
            let data = self
                .buffers
                .get_mut(*id)
                .map(std::mem::take)
                .ok_or(ComputeError::UnknownBuffer(*id))?;
            writes.push(data);
        }

        let mut call = KernelCall {
            params: invocation.params(),
            width: invocation.width(),
            reads,
            writes,
        };
        kernel(&mut call);

        for (id, data) in writable.iter().zip(call.writes) {
            if let Some(slot) = self.buffers.get_mut(*id) {
                *slot = data;
            }
        }

        self.trace.push(DispatchRecord {
            kernel: name,
            width: invocation.width(),
            buffers: invocation.bindings().iter().map(|b| b.buffer).collect(),
        });

        Ok(())
    }
}

impl Default for ReferenceBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ComputeBackend for ReferenceBackend {
    fn name(&self) -> &'static str {
        "reference"
    }

    fn resolve_kernel(&mut self, name: &str) -> Result<KernelHandle> {
        let signature =
            kernels::lookup(name).ok_or_else(|| ComputeError::UnknownKernel(name.to_string()))?;
        if Self::kernel_fn(name).is_none() {
            return Err(ComputeError::UnknownKernel(name.to_string()));
        }
        Ok(KernelHandle::new(signature))
    }

    fn allocate_buffer(&mut self, len: usize) -> Result<BufferId> {
        if len == 0 {
            return Err(ComputeError::EmptyBuffer);
        }
        let id = self.buffers.insert(vec![0.0; len]);
        debug!(buffer = %id, len, "Allocated reference buffer");
        Ok(id)
    }

    fn release_buffer(&mut self, id: BufferId) {
        self.buffers.remove(id);
    }

    fn buffer_len(&self, id: BufferId) -> Option<usize> {
        self.buffers.get(id).map(Vec::len)
    }

    fn live_buffers(&self) -> usize {
        self.buffers.live()
    }

    fn write_buffer(&mut self, id: BufferId, data: &[f32]) -> Result<()> {
        let buffer = self
            .buffers
            .get_mut(id)
            .ok_or(ComputeError::UnknownBuffer(id))?;
        if buffer.len() != data.len() {
            return Err(ComputeError::LengthMismatch {
                buffer: id,
                expected: buffer.len(),
                actual: data.len(),
            });
        }
        buffer.copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&mut self, id: BufferId) -> Result<Vec<f32>> {
        self.buffers
            .get(id)
            .cloned()
            .ok_or(ComputeError::UnknownBuffer(id))
    }

    fn max_dispatch_width(&self) -> usize {
        MAX_DISPATCH_WIDTH
    }

    fn dispatch(&mut self, invocations: &[&Invocation]) -> Result<Completion> {
        for invocation in invocations {
            self.run(invocation)?;
        }
        self.submissions += 1;
        Ok(Completion::new(self.submissions))
    }

    fn wait(&mut self, completion: Completion) -> Result<()> {
        // Dispatch is synchronous; only reject tokens from the future.
        if completion.sequence() > self.submissions {
            return Err(ComputeError::UnknownCompletion(completion.sequence()));
        }
        Ok(())
    }
}

fn unary(call: &mut KernelCall<'_>, f: fn(f32) -> f32) {
    let params: ElementwiseParams = call.params();
    let count = call.width.min(params.element_count());
    let input = &call.reads[0];
    let output = &mut call.writes[0];
    for i in 0..count {
        output[i] = f(input[i]);
    }
}

fn unary_backward(call: &mut KernelCall<'_>, f: fn(f32, f32) -> f32) {
    let params: ElementwiseParams = call.params();
    let count = call.width.min(params.element_count());
    let output_deltas = &call.reads[0];
    let input = &call.reads[1];
    let input_deltas = &mut call.writes[0];
    for i in 0..count {
        input_deltas[i] = f(output_deltas[i], input[i]);
    }
}

fn linear_forward(call: &mut KernelCall<'_>) {
    let params: LinearParams = call.params();
    let input_size = params.input_size as usize;
    let output_size = params.output_size as usize;
    let count = call.width.min(params.batch_size as usize * output_size);

    let (input, weights, biases) = (&call.reads[0], &call.reads[1], &call.reads[2]);
    let output = &mut call.writes[0];

    for i in 0..count {
        let b = i / output_size;
        let o = i % output_size;
        let mut sum = biases[o];
        for j in 0..input_size {
            sum += input[b * input_size + j] * weights[j * output_size + o];
        }
        output[i] = sum;
    }
}

fn linear_backward(call: &mut KernelCall<'_>) {
    let params: LinearParams = call.params();
    let input_size = params.input_size as usize;
    let output_size = params.output_size as usize;
    let count = call.width.min(params.batch_size as usize * input_size);

    let (output_deltas, weights) = (&call.reads[0], &call.reads[1]);
    let input_deltas = &mut call.writes[0];

    for i in 0..count {
        let b = i / input_size;
        let j = i % input_size;
        let mut sum = 0.0;
        for o in 0..output_size {
            sum += output_deltas[b * output_size + o] * weights[j * output_size + o];
        }
        input_deltas[i] = sum;
    }
}

fn lstm_forward(call: &mut KernelCall<'_>) {
    let params: LstmParams = call.params();
    let input_size = params.input_size as usize;
    let units = params.units as usize;
    let count = call.width.min(params.batch_size as usize * units);
    let stride = 4 * units;

    let (input, weights, biases, state) = (
        &call.reads[0],
        &call.reads[1],
        &call.reads[2],
        &call.reads[3],
    );
    let [output, next_state] = &mut call.writes[..] else {
        return;
    };

    for i in 0..count {
        let b = i / units;
        let u = i % units;
        let state_row = b * 2 * units;

        let mut z = [
            biases[u],
            biases[units + u],
            biases[2 * units + u],
            biases[3 * units + u],
        ];

        let concat = (0..input_size)
            .map(|j| input[b * input_size + j])
            .chain((0..units).map(|k| state[state_row + k]));
        for (row, x) in concat.enumerate() {
            let base = row * stride;
            for (gate, acc) in z.iter_mut().enumerate() {
                *acc += x * weights[base + gate * units + u];
            }
        }

        let [zi, zg, zf, zo] = z;
        let c_prev = state[state_row + units + u];
        let mut c = sigmoid(zf) * c_prev + sigmoid(zi) * stable_tanh(zg);
        if params.clip_to > 0.0 {
            c = c.clamp(-params.clip_to, params.clip_to);
        }
        let h = sigmoid(zo) * stable_tanh(c);

        output[i] = h;
        next_state[state_row + u] = h;
        next_state[state_row + units + u] = c;
    }
}

fn softmax_forward(call: &mut KernelCall<'_>) {
    let params: ElementwiseParams = call.params();
    let size = params.size as usize;
    let count = call.width.min(params.element_count());
    let input = &call.reads[0];
    let output = &mut call.writes[0];

    for i in 0..count {
        let start = (i / size) * size;
        let row = &input[start..start + size];
        let max_value = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let sum: f32 = row.iter().map(|&v| (v - max_value).exp()).sum();
        output[i] = (input[i] - max_value).exp() / sum;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Binding, BufferRole};

    fn bind(buffer: BufferId, role: BufferRole, access: Access) -> Binding {
        Binding {
            buffer,
            role,
            access,
        }
    }

    #[test]
    fn test_allocate_zeroed() {
        let mut backend = ReferenceBackend::new();
        let id = backend.allocate_buffer(4).unwrap();
        assert_eq!(backend.read_buffer(id).unwrap(), vec![0.0; 4]);
        assert_eq!(backend.buffer_len(id), Some(4));
    }

    #[test]
    fn test_allocate_empty_fails() {
        let mut backend = ReferenceBackend::new();
        assert!(matches!(
            backend.allocate_buffer(0),
            Err(ComputeError::EmptyBuffer)
        ));
    }

    #[test]
    fn test_write_length_mismatch() {
        let mut backend = ReferenceBackend::new();
        let id = backend.allocate_buffer(3).unwrap();
        let result = backend.write_buffer(id, &[1.0, 2.0]);
        assert!(matches!(
            result,
            Err(ComputeError::LengthMismatch {
                expected: 3,
                actual: 2,
                ..
            })
        ));
    }

    #[test]
    fn test_release_then_read_fails() {
        let mut backend = ReferenceBackend::new();
        let id = backend.allocate_buffer(3).unwrap();
        backend.release_buffer(id);
        assert_eq!(backend.live_buffers(), 0);
        assert!(matches!(
            backend.read_buffer(id),
            Err(ComputeError::UnknownBuffer(_))
        ));
    }

    #[test]
    fn test_unknown_kernel() {
        let mut backend = ReferenceBackend::new();
        assert!(matches!(
            backend.resolve_kernel("conv_forward"),
            Err(ComputeError::UnknownKernel(_))
        ));
    }

    #[test]
    fn test_every_registered_kernel_resolves() {
        let mut backend = ReferenceBackend::new();
        for kernel in kernels::KERNELS {
            backend.resolve_kernel(kernel.name).unwrap();
        }
    }

    #[test]
    fn test_sigmoid_dispatch_respects_width() {
        let mut backend = ReferenceBackend::new();
        let input = backend.allocate_buffer(4).unwrap();
        let output = backend.allocate_buffer(4).unwrap();
        backend.write_buffer(input, &[0.0, 1.0, -1.0, 2.0]).unwrap();

        let kernel = backend.resolve_kernel("sigmoid_forward").unwrap();
        let params = ElementwiseParams::new(1, 4);
        let inv = Invocation::new(
            kernel,
            vec![
                bind(input, BufferRole::Input, Access::Read),
                bind(output, BufferRole::Output, Access::ReadWrite),
            ],
            bytemuck::bytes_of(&params).to_vec(),
            3,
        );

        let done = backend.dispatch(&[&inv]).unwrap();
        backend.wait(done).unwrap();

        let result = backend.read_buffer(output).unwrap();
        assert!((result[0] - 0.5).abs() < 1e-6);
        assert!((result[1] - sigmoid(1.0)).abs() < 1e-6);
        assert!((result[2] - sigmoid(-1.0)).abs() < 1e-6);
        // Fourth thread was not dispatched
        assert_eq!(result[3], 0.0);
    }

    #[test]
    fn test_trace_records_order() {
        let mut backend = ReferenceBackend::new();
        let trace = backend.trace();
        let a = backend.allocate_buffer(2).unwrap();
        let b = backend.allocate_buffer(2).unwrap();
        let c = backend.allocate_buffer(2).unwrap();
        let params = bytemuck::bytes_of(&ElementwiseParams::new(1, 2)).to_vec();

        let relu = backend.resolve_kernel("relu_forward").unwrap();
        let copy = backend.resolve_kernel("buffer_copy").unwrap();
        let first = Invocation::new(
            relu,
            vec![
                bind(a, BufferRole::Input, Access::Read),
                bind(b, BufferRole::Output, Access::ReadWrite),
            ],
            params.clone(),
            2,
        );
        let second = Invocation::new(
            copy,
            vec![
                bind(b, BufferRole::Input, Access::Read),
                bind(c, BufferRole::Output, Access::ReadWrite),
            ],
            params,
            2,
        );

        backend.write_buffer(a, &[-3.0, 3.0]).unwrap();
        let done = backend.dispatch(&[&first, &second]).unwrap();
        backend.wait(done).unwrap();

        assert_eq!(trace.kernel_names(), vec!["relu_forward", "buffer_copy"]);
        // Second kernel saw the first kernel's output
        assert_eq!(backend.read_buffer(c).unwrap(), vec![0.0, 3.0]);
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let mut backend = ReferenceBackend::new();
        let input = backend.allocate_buffer(6).unwrap();
        let output = backend.allocate_buffer(6).unwrap();
        backend
            .write_buffer(input, &[1.0, 2.0, 3.0, 100.0, 100.0, 100.0])
            .unwrap();

        let kernel = backend.resolve_kernel("softmax_forward").unwrap();
        let params = ElementwiseParams::new(2, 3);
        let inv = Invocation::new(
            kernel,
            vec![
                bind(input, BufferRole::Input, Access::Read),
                bind(output, BufferRole::Output, Access::ReadWrite),
            ],
            bytemuck::bytes_of(&params).to_vec(),
            6,
        );
        let done = backend.dispatch(&[&inv]).unwrap();
        backend.wait(done).unwrap();

        let result = backend.read_buffer(output).unwrap();
        let first: f32 = result[..3].iter().sum();
        assert!((first - 1.0).abs() < 1e-6);
        assert!(result[2] > result[1] && result[1] > result[0]);
        for value in &result[3..] {
            assert!((value - 1.0 / 3.0).abs() < 1e-6);
        }
    }

    fn run_one(
        backend: &mut ReferenceBackend,
        kernel: &str,
        bindings: Vec<Binding>,
        params: &[u8],
        width: usize,
    ) {
        let kernel = backend.resolve_kernel(kernel).unwrap();
        let inv = Invocation::new(kernel, bindings, params.to_vec(), width);
        let done = backend.dispatch(&[&inv]).unwrap();
        backend.wait(done).unwrap();
    }

    #[test]
    fn test_linear_forward_batch() {
        let mut backend = ReferenceBackend::new();
        // 2 inputs → 3 outputs, batch of 2
        let input = backend.allocate_buffer(4).unwrap();
        let weights = backend.allocate_buffer(6).unwrap();
        let biases = backend.allocate_buffer(3).unwrap();
        let output = backend.allocate_buffer(6).unwrap();
        backend.write_buffer(input, &[1.0, 2.0, -1.0, 0.5]).unwrap();
        backend
            .write_buffer(weights, &[1.0, 0.0, 2.0, 0.0, 1.0, -1.0])
            .unwrap();
        backend.write_buffer(biases, &[0.5, 0.0, 1.0]).unwrap();

        let params = LinearParams::new(2, 2, 3);
        run_one(
            &mut backend,
            "linear_forward",
            vec![
                bind(input, BufferRole::Input, Access::Read),
                bind(weights, BufferRole::Weights, Access::Read),
                bind(biases, BufferRole::Biases, Access::Read),
                bind(output, BufferRole::Output, Access::ReadWrite),
            ],
            bytemuck::bytes_of(&params),
            6,
        );

        let result = backend.read_buffer(output).unwrap();
        let expected = [1.5, 2.0, 1.0, -0.5, 0.5, -1.5];
        for (actual, expected) in result.iter().zip(expected) {
            approx::assert_relative_eq!(*actual, expected, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_linear_backward_is_transpose() {
        let mut backend = ReferenceBackend::new();
        let deltas = backend.allocate_buffer(3).unwrap();
        let weights = backend.allocate_buffer(6).unwrap();
        let input_deltas = backend.allocate_buffer(2).unwrap();
        backend.write_buffer(deltas, &[1.0, 1.0, 1.0]).unwrap();
        backend
            .write_buffer(weights, &[1.0, 0.0, 2.0, 0.0, 1.0, -1.0])
            .unwrap();

        let params = LinearParams::new(1, 2, 3);
        run_one(
            &mut backend,
            "linear_backward",
            vec![
                bind(deltas, BufferRole::OutputDeltas, Access::Read),
                bind(weights, BufferRole::Weights, Access::Read),
                bind(input_deltas, BufferRole::InputDeltas, Access::ReadWrite),
            ],
            bytemuck::bytes_of(&params),
            2,
        );

        assert_eq!(backend.read_buffer(input_deltas).unwrap(), vec![3.0, 0.0]);
    }

    #[test]
    fn test_lstm_single_unit_step() {
        let mut backend = ReferenceBackend::new();
        // One input, one unit: weights rows are [x, h], columns [i, g, f, o]
        let input = backend.allocate_buffer(1).unwrap();
        let weights = backend.allocate_buffer(8).unwrap();
        let biases = backend.allocate_buffer(4).unwrap();
        let state = backend.allocate_buffer(2).unwrap();
        let output = backend.allocate_buffer(1).unwrap();
        let next_state = backend.allocate_buffer(2).unwrap();

        backend.write_buffer(input, &[1.0]).unwrap();
        backend
            .write_buffer(weights, &[0.5, 1.0, 0.0, 2.0, 0.0, 0.0, 1.0, 0.0])
            .unwrap();
        backend.write_buffer(biases, &[0.0, 0.0, 0.0, 0.0]).unwrap();
        backend.write_buffer(state, &[0.5, 0.25]).unwrap();

        let params = LstmParams::new(1, 1, 1, None);
        run_one(
            &mut backend,
            "lstm_forward",
            vec![
                bind(input, BufferRole::Input, Access::Read),
                bind(weights, BufferRole::Weights, Access::Read),
                bind(biases, BufferRole::Biases, Access::Read),
                bind(state, BufferRole::State, Access::Read),
                bind(output, BufferRole::Output, Access::ReadWrite),
                bind(next_state, BufferRole::NextState, Access::ReadWrite),
            ],
            bytemuck::bytes_of(&params),
            1,
        );

        // z = x * row0 + h * row1
        let zi: f32 = 0.5;
        let zg: f32 = 1.0;
        let zf: f32 = 0.5;
        let zo: f32 = 2.0;
        let c = sigmoid(zf) * 0.25 + sigmoid(zi) * zg.tanh();
        let h = sigmoid(zo) * c.tanh();

        let out = backend.read_buffer(output).unwrap();
        let next = backend.read_buffer(next_state).unwrap();
        approx::assert_relative_eq!(out[0], h, epsilon = 1e-5);
        approx::assert_relative_eq!(next[0], h, epsilon = 1e-5);
        approx::assert_relative_eq!(next[1], c, epsilon = 1e-5);
        // Previous state untouched
        assert_eq!(backend.read_buffer(state).unwrap(), vec![0.5, 0.25]);
    }

    #[test]
    fn test_lstm_cell_clipping() {
        let mut backend = ReferenceBackend::new();
        let input = backend.allocate_buffer(1).unwrap();
        let weights = backend.allocate_buffer(8).unwrap();
        let biases = backend.allocate_buffer(4).unwrap();
        let state = backend.allocate_buffer(2).unwrap();
        let output = backend.allocate_buffer(1).unwrap();
        let next_state = backend.allocate_buffer(2).unwrap();

        backend.write_buffer(input, &[0.0]).unwrap();
        // Forget gate saturated open, large carried cell value
        backend.write_buffer(biases, &[0.0, 0.0, 50.0, 0.0]).unwrap();
        backend.write_buffer(state, &[0.0, 10.0]).unwrap();

        let params = LstmParams::new(1, 1, 1, Some(3.0));
        run_one(
            &mut backend,
            "lstm_forward",
            vec![
                bind(input, BufferRole::Input, Access::Read),
                bind(weights, BufferRole::Weights, Access::Read),
                bind(biases, BufferRole::Biases, Access::Read),
                bind(state, BufferRole::State, Access::Read),
                bind(output, BufferRole::Output, Access::ReadWrite),
                bind(next_state, BufferRole::NextState, Access::ReadWrite),
            ],
            bytemuck::bytes_of(&params),
            1,
        );

        let next = backend.read_buffer(next_state).unwrap();
        approx::assert_relative_eq!(next[1], 3.0, epsilon = 1e-6);
    }

    #[test]
    fn test_wait_rejects_future_token() {
        let mut backend = ReferenceBackend::new();
        assert!(backend.wait(Completion::new(5)).is_err());
    }
}
