use haiku_compute::{BufferRole, ElementwiseParams, Invocation};

use crate::{ForwardInvocationBuilder, Result};

/// Row-wise softmax over `size` elements per batch item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Softmax {
    size: usize,
}

impl Softmax {
    pub fn new(size: usize) -> Self {
        Self { size }
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
            "softmax_forward",
            &buffers,
            &ElementwiseParams::new(batch_size, self.size),
            self.size * batch_size,
        )?;
        Ok(vec![invocation])
    }
}
