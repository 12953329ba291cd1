use haiku_compute::{BufferRole, ElementwiseParams, Invocation};

use crate::{BackwardInvocationBuilder, ForwardInvocationBuilder, Result};

/// Elementwise nonlinearity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationFunction {
    Sigmoid,
    Tanh,
    Relu,
}

impl ActivationFunction {
    pub fn name(self) -> &'static str {
        match self {
            Self::Sigmoid => "sigmoid",
            Self::Tanh => "tanh",
            Self::Relu => "relu",
        }
    }

    fn forward_kernel(self) -> &'static str {
        match self {
            Self::Sigmoid => "sigmoid_forward",
            Self::Tanh => "tanh_forward",
            Self::Relu => "relu_forward",
        }
    }

    fn backward_kernel(self) -> &'static str {
        match self {
            Self::Sigmoid => "sigmoid_backward",
            Self::Tanh => "tanh_backward",
            Self::Relu => "relu_backward",
        }
    }
}

/// Activation layer with `input_size == output_size == size`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activation {
    function: ActivationFunction,
    size: usize,
}

impl Activation {
    pub fn new(function: ActivationFunction, size: usize) -> Self {
        Self { function, size }
    }

    pub fn function(&self) -> ActivationFunction {
        self.function
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn forward(
        &self,
        builder: &mut ForwardInvocationBuilder<'_>,
    ) -> Result<Vec<Invocation>> {
        let batch_size = builder.batch_size();
        let buffers = [
            (BufferRole::Input, builder.input_buffer()),
            (BufferRole::Output, builder.output_buffer()),
        ];
        let invocation = builder.create_invocation(
            self.function.forward_kernel(),
            &buffers,
            &ElementwiseParams::new(batch_size, self.size),
            self.size * batch_size,
        )?;
        Ok(vec![invocation])
    }

    pub(crate) fn backward(
        &self,
        builder: &mut BackwardInvocationBuilder<'_>,
    ) -> Result<Vec<Invocation>> {
        let batch_size = builder.batch_size();
        let buffers = [
            (BufferRole::OutputDeltas, builder.output_deltas_buffer()),
            (BufferRole::Input, builder.input_buffer()),
            (BufferRole::InputDeltas, builder.input_deltas_buffer()),
        ];
        let invocation = builder.create_invocation(
            self.function.backward_kernel(),
            &buffers,
            &ElementwiseParams::new(batch_size, self.size),
            self.size * batch_size,
        )?;
        Ok(vec![invocation])
    }
}
