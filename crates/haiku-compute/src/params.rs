//! GPU-compatible kernel parameter records
//!
//! Parameters are passed by value into a uniform binding. Every record is
//! padded to 16 bytes to satisfy uniform buffer layout rules.
//!
//! A record also fixes how long each bound buffer must be: the kernels index
//! by these sizes, so [`KernelParams::required_len`] is checked before an
//! invocation is built.

use bytemuck::{Pod, Zeroable};

use crate::BufferRole;

/// A parameter record that can be bound to a kernel
pub trait KernelParams: Pod {
    /// Minimum length of a buffer bound as `role`, or `None` if the kernel
    /// never binds that role with these parameters
    fn required_len(&self, role: BufferRole) -> Option<usize>;
}

/// Parameters for elementwise kernels (activations, softmax, copies)
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct ElementwiseParams {
    pub batch_size: u32,
    pub size: u32,
    pub _padding: [u32; 2],
}

impl ElementwiseParams {
    pub fn new(batch_size: usize, size: usize) -> Self {
        Self {
            batch_size: batch_size as u32,
            size: size as u32,
            _padding: [0; 2],
        }
    }

    /// Number of elements the kernel touches
    pub fn element_count(&self) -> usize {
        self.batch_size as usize * self.size as usize
    }
}

impl KernelParams for ElementwiseParams {
    fn required_len(&self, role: BufferRole) -> Option<usize> {
        match role {
            BufferRole::Weights | BufferRole::Biases => None,
            _ => Some(self.element_count()),
        }
    }
}

/// Parameters for the inner product kernels
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct LinearParams {
    pub batch_size: u32,
    pub input_size: u32,
    pub output_size: u32,
    pub _padding: u32,
}

impl LinearParams {
    pub fn new(batch_size: usize, input_size: usize, output_size: usize) -> Self {
        Self {
            batch_size: batch_size as u32,
            input_size: input_size as u32,
            output_size: output_size as u32,
            _padding: 0,
        }
    }
}

impl KernelParams for LinearParams {
    fn required_len(&self, role: BufferRole) -> Option<usize> {
        let (batch, input, output) = (
            self.batch_size as usize,
            self.input_size as usize,
            self.output_size as usize,
        );
        match role {
            BufferRole::Input | BufferRole::InputDeltas => Some(batch * input),
            BufferRole::Output | BufferRole::OutputDeltas => Some(batch * output),
            BufferRole::Weights => Some(input * output),
            BufferRole::Biases => Some(output),
            BufferRole::State | BufferRole::NextState => None,
        }
    }
}

/// Parameters for the LSTM step kernel
///
/// `clip_to <= 0.0` disables cell clipping.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct LstmParams {
    pub batch_size: u32,
    pub input_size: u32,
    pub units: u32,
    pub clip_to: f32,
}

impl LstmParams {
    pub fn new(batch_size: usize, input_size: usize, units: usize, clip_to: Option<f32>) -> Self {
        Self {
            batch_size: batch_size as u32,
            input_size: input_size as u32,
            units: units as u32,
            clip_to: clip_to.unwrap_or(0.0),
        }
    }
}

impl KernelParams for LstmParams {
    fn required_len(&self, role: BufferRole) -> Option<usize> {
        let (batch, input, units) = (
            self.batch_size as usize,
            self.input_size as usize,
            self.units as usize,
        );
        match role {
            BufferRole::Input => Some(batch * input),
            BufferRole::Output => Some(batch * units),
            BufferRole::Weights => Some((input + units) * 4 * units),
            BufferRole::Biases => Some(4 * units),
            // [h, c] per batch item
            BufferRole::State | BufferRole::NextState => Some(batch * 2 * units),
            BufferRole::OutputDeltas | BufferRole::InputDeltas => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_are_uniform_sized() {
        assert_eq!(std::mem::size_of::<ElementwiseParams>(), 16);
        assert_eq!(std::mem::size_of::<LinearParams>(), 16);
        assert_eq!(std::mem::size_of::<LstmParams>(), 16);
    }

    #[test]
    fn test_elementwise_element_count() {
        let params = ElementwiseParams::new(3, 7);
        assert_eq!(params.element_count(), 21);
    }

    #[test]
    fn test_lstm_clip_default() {
        assert_eq!(LstmParams::new(1, 4, 8, None).clip_to, 0.0);
        assert_eq!(LstmParams::new(1, 4, 8, Some(5.0)).clip_to, 5.0);
    }

    #[test]
    fn test_bytes_round_trip() {
        let params = LinearParams::new(2, 3, 4);
        let bytes = bytemuck::bytes_of(&params);
        let decoded: LinearParams = bytemuck::pod_read_unaligned(bytes);
        assert_eq!(decoded, params);
    }

    #[test]
    fn test_required_lengths() {
        let linear = LinearParams::new(2, 3, 4);
        assert_eq!(linear.required_len(BufferRole::Input), Some(6));
        assert_eq!(linear.required_len(BufferRole::Output), Some(8));
        assert_eq!(linear.required_len(BufferRole::Weights), Some(12));
        assert_eq!(linear.required_len(BufferRole::Biases), Some(4));
        assert_eq!(linear.required_len(BufferRole::State), None);

        let lstm = LstmParams::new(2, 5, 3, None);
        assert_eq!(lstm.required_len(BufferRole::Weights), Some(96));
        assert_eq!(lstm.required_len(BufferRole::Biases), Some(12));
        assert_eq!(lstm.required_len(BufferRole::State), Some(12));
        assert_eq!(lstm.required_len(BufferRole::Output), Some(6));

        let copy = ElementwiseParams::new(2, 6);
        assert_eq!(copy.required_len(BufferRole::NextState), Some(12));
        assert_eq!(copy.required_len(BufferRole::Weights), None);
    }
}
