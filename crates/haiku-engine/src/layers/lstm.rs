use haiku_compute::{BufferRole, ElementwiseParams, Invocation, LstmParams};

use super::linear::check_len;
use crate::{ForwardInvocationBuilder, Result};

/// Long short-term memory layer
///
/// Weights are row-major `[input_size + units][4 * units]`, the rows for
/// the input first and the recurrent rows after. Gate blocks within a row
/// are ordered input, candidate, forget, output. Each batch item keeps a
/// `[h, c]` state row that survives between steps.
#[derive(Debug, Clone, PartialEq)]
pub struct Lstm {
    input_size: usize,
    units: usize,
    clip_to: Option<f32>,
    weights: Vec<f32>,
    biases: Vec<f32>,
}

impl Lstm {
    pub fn new(
        input_size: usize,
        units: usize,
        weights: Vec<f32>,
        biases: Vec<f32>,
        clip_to: Option<f32>,
    ) -> Result<Self> {
        check_len("weights", (input_size + units) * 4 * units, weights.len())?;
        check_len("biases", 4 * units, biases.len())?;
        Ok(Self {
            input_size,
            units,
            clip_to,
            weights,
            biases,
        })
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn units(&self) -> usize {
        self.units
    }

    /// Cell values are clamped to `±clip_to` when set
    pub fn clip_to(&self) -> Option<f32> {
        self.clip_to
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    pub fn biases(&self) -> &[f32] {
        &self.biases
    }

    /// Floats of recurrent state per batch item
    pub fn state_size(&self) -> usize {
        2 * self.units
    }

    /// Step kernel followed by a copy of the new state over the old one
    pub(crate) fn forward(
        &self,
        builder: &mut ForwardInvocationBuilder<'_>,
    ) -> Result<Vec<Invocation>> {
        let batch_size = builder.batch_size();
        let state_len = self.state_size() * batch_size;

        let weights = builder.parameter_buffer(BufferRole::Weights, &self.weights)?;
        let biases = builder.parameter_buffer(BufferRole::Biases, &self.biases)?;
        let state = builder.state_buffer(state_len)?;
        let next_state = builder.state_buffer(state_len)?;

        let buffers = [
            (BufferRole::Input, builder.input_buffer()),
            (BufferRole::Weights, weights),
            (BufferRole::Biases, biases),
            (BufferRole::State, state),
            (BufferRole::Output, builder.output_buffer()),
            (BufferRole::NextState, next_state),
        ];
        let step = builder.create_invocation(
            "lstm_forward",
            &buffers,
            &LstmParams::new(batch_size, self.input_size, self.units, self.clip_to),
            self.units * batch_size,
        )?;

        let carry = builder.create_invocation(
            "buffer_copy",
            &[
                (BufferRole::NextState, next_state),
                (BufferRole::State, state),
            ],
            &ElementwiseParams::new(batch_size, self.state_size()),
            state_len,
        )?;

        Ok(vec![step, carry])
    }
}
