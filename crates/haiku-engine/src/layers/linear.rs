use haiku_compute::{BufferRole, Invocation, LinearParams};

use crate::{BackwardInvocationBuilder, EngineError, ForwardInvocationBuilder, Result};

/// Fully connected layer
///
/// `weights` is row-major `[input_size][output_size]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Linear {
    input_size: usize,
    output_size: usize,
    weights: Vec<f32>,
    biases: Vec<f32>,
}

impl Linear {
    pub fn new(
        input_size: usize,
        output_size: usize,
        weights: Vec<f32>,
        biases: Vec<f32>,
    ) -> Result<Self> {
        check_len("weights", input_size * output_size, weights.len())?;
        check_len("biases", output_size, biases.len())?;
        Ok(Self {
            input_size,
            output_size,
            weights,
            biases,
        })
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn output_size(&self) -> usize {
        self.output_size
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    pub fn biases(&self) -> &[f32] {
        &self.biases
    }

    fn params(&self, batch_size: usize) -> LinearParams {
        LinearParams::new(batch_size, self.input_size, self.output_size)
    }

    pub(crate) fn forward(
        &self,
        builder: &mut ForwardInvocationBuilder<'_>,
    ) -> Result<Vec<Invocation>> {
        let batch_size = builder.batch_size();
        let weights = builder.parameter_buffer(BufferRole::Weights, &self.weights)?;
        let biases = builder.parameter_buffer(BufferRole::Biases, &self.biases)?;
        let buffers = [
            (BufferRole::Input, builder.input_buffer()),
            (BufferRole::Weights, weights),
            (BufferRole::Biases, biases),
            (BufferRole::Output, builder.output_buffer()),
        ];
        let invocation = builder.create_invocation(
            "linear_forward",
            &buffers,
            &self.params(batch_size),
            self.output_size * batch_size,
        )?;
        Ok(vec![invocation])
    }

    /// Input deltas only; the weight buffer is shared with the forward pass
    pub(crate) fn backward(
        &self,
        forward: &[Invocation],
        builder: &mut BackwardInvocationBuilder<'_>,
    ) -> Result<Vec<Invocation>> {
        let batch_size = builder.batch_size();
        let weights = forward
            .iter()
            .find_map(|inv| inv.buffer(BufferRole::Weights))
            .ok_or(EngineError::NotInitialized)?;
        let buffers = [
            (BufferRole::OutputDeltas, builder.output_deltas_buffer()),
            (BufferRole::Weights, weights),
            (BufferRole::InputDeltas, builder.input_deltas_buffer()),
        ];
        let invocation = builder.create_invocation(
            "linear_backward",
            &buffers,
            &self.params(batch_size),
            self.input_size * batch_size,
        )?;
        Ok(vec![invocation])
    }
}

pub(super) fn check_len(what: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(EngineError::WeightLength {
            what,
            expected,
            actual,
        });
    }
    Ok(())
}
