//! The layer contract
//!
//! A [`Layer`] is a closed set of kinds plus two cached invocation lists,
//! one per pass. Each list is either uninitialized or holds the
//! invocations built by the last `initialize_*` call; reading an
//! uninitialized list is a usage bug and panics.

use haiku_compute::{BufferId, BufferRole, Invocation};
use tracing::debug;
use uuid::Uuid;

use crate::layers::{Activation, ActivationFunction, Linear, Lstm, Softmax};
use crate::{BackwardInvocationBuilder, EngineError, ForwardInvocationBuilder, Result};

/// Layer variants
#[derive(Debug, Clone, PartialEq)]
pub enum LayerKind {
    Activation(Activation),
    Linear(Linear),
    Lstm(Lstm),
    Softmax(Softmax),
}

impl LayerKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Activation(activation) => activation.function().name(),
            Self::Linear(_) => "linear",
            Self::Lstm(_) => "lstm",
            Self::Softmax(_) => "softmax",
        }
    }
}

#[derive(Debug, Clone, Default)]
enum InvocationSlot {
    #[default]
    Uninitialized,
    Initialized(Vec<Invocation>),
}

/// One node of a network
#[derive(Debug, Clone)]
pub struct Layer {
    id: Uuid,
    name: Option<String>,
    kind: LayerKind,
    forward: InvocationSlot,
    backward: InvocationSlot,
}

impl Layer {
    pub fn new(kind: LayerKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: None,
            kind,
            forward: InvocationSlot::Uninitialized,
            backward: InvocationSlot::Uninitialized,
        }
    }

    pub fn sigmoid(size: usize) -> Self {
        Self::activation(ActivationFunction::Sigmoid, size)
    }

    pub fn tanh(size: usize) -> Self {
        Self::activation(ActivationFunction::Tanh, size)
    }

    pub fn relu(size: usize) -> Self {
        Self::activation(ActivationFunction::Relu, size)
    }

    pub fn activation(function: ActivationFunction, size: usize) -> Self {
        Self::new(LayerKind::Activation(Activation::new(function, size)))
    }

    /// Fully connected layer; fails if the weight or bias length is wrong
    pub fn linear(
        input_size: usize,
        output_size: usize,
        weights: Vec<f32>,
        biases: Vec<f32>,
    ) -> Result<Self> {
        let linear = Linear::new(input_size, output_size, weights, biases)?;
        Ok(Self::new(LayerKind::Linear(linear)))
    }

    /// Recurrent layer; fails if the weight or bias length is wrong
    pub fn lstm(
        input_size: usize,
        units: usize,
        weights: Vec<f32>,
        biases: Vec<f32>,
        clip_to: Option<f32>,
    ) -> Result<Self> {
        let lstm = Lstm::new(input_size, units, weights, biases, clip_to)?;
        Ok(Self::new(LayerKind::Lstm(lstm)))
    }

    pub fn softmax(size: usize) -> Self {
        Self::new(LayerKind::Softmax(Softmax::new(size)))
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn kind(&self) -> &LayerKind {
        &self.kind
    }

    /// Elements per batch item consumed
    pub fn input_size(&self) -> usize {
        match &self.kind {
            LayerKind::Activation(activation) => activation.size(),
            LayerKind::Linear(linear) => linear.input_size(),
            LayerKind::Lstm(lstm) => lstm.input_size(),
            LayerKind::Softmax(softmax) => softmax.size(),
        }
    }

    /// Elements per batch item produced
    pub fn output_size(&self) -> usize {
        match &self.kind {
            LayerKind::Activation(activation) => activation.size(),
            LayerKind::Linear(linear) => linear.output_size(),
            LayerKind::Lstm(lstm) => lstm.units(),
            LayerKind::Softmax(softmax) => softmax.size(),
        }
    }

    /// Build and cache the forward invocations
    ///
    /// Replaces anything cached by an earlier call and drops the backward
    /// invocations, which may reference buffers of the old forward pass.
    pub fn initialize_forward(
        &mut self,
        builder: &mut ForwardInvocationBuilder<'_>,
    ) -> Result<()> {
        self.forward = InvocationSlot::Uninitialized;
        self.backward = InvocationSlot::Uninitialized;

        let invocations = match &self.kind {
            LayerKind::Activation(activation) => activation.forward(builder)?,
            LayerKind::Linear(linear) => linear.forward(builder)?,
            LayerKind::Lstm(lstm) => lstm.forward(builder)?,
            LayerKind::Softmax(softmax) => softmax.forward(builder)?,
        };

        debug!(
            layer = %self.id,
            kind = self.kind.name(),
            invocations = invocations.len(),
            "Initialized forward pass"
        );
        self.forward = InvocationSlot::Initialized(invocations);
        Ok(())
    }

    /// Build and cache the backward invocations
    ///
    /// Needs the forward pass to be initialized first.
    pub fn initialize_backward(
        &mut self,
        builder: &mut BackwardInvocationBuilder<'_>,
    ) -> Result<()> {
        self.backward = InvocationSlot::Uninitialized;
        let InvocationSlot::Initialized(forward) = &self.forward else {
            return Err(EngineError::NotInitialized);
        };

        let invocations = match &self.kind {
            LayerKind::Activation(activation) => activation.backward(builder)?,
            LayerKind::Linear(linear) => linear.backward(forward, builder)?,
            LayerKind::Lstm(_) | LayerKind::Softmax(_) => {
                return Err(EngineError::BackwardUnsupported(self.kind.name()));
            }
        };

        debug!(
            layer = %self.id,
            kind = self.kind.name(),
            invocations = invocations.len(),
            "Initialized backward pass"
        );
        self.backward = InvocationSlot::Initialized(invocations);
        Ok(())
    }

    /// Cached forward invocations
    ///
    /// # Panics
    ///
    /// If [`initialize_forward`](Self::initialize_forward) has not succeeded.
    pub fn forward_invocations(&self) -> &[Invocation] {
        match &self.forward {
            InvocationSlot::Initialized(invocations) => invocations,
            InvocationSlot::Uninitialized => {
                panic!("initialize_forward needs to be called first")
            }
        }
    }

    /// Cached backward invocations
    ///
    /// # Panics
    ///
    /// If [`initialize_backward`](Self::initialize_backward) has not succeeded.
    pub fn backward_invocations(&self) -> &[Invocation] {
        match &self.backward {
            InvocationSlot::Initialized(invocations) => invocations,
            InvocationSlot::Uninitialized => {
                panic!("initialize_backward needs to be called first")
            }
        }
    }

    pub fn is_forward_initialized(&self) -> bool {
        matches!(self.forward, InvocationSlot::Initialized(_))
    }

    pub fn is_backward_initialized(&self) -> bool {
        matches!(self.backward, InvocationSlot::Initialized(_))
    }

    /// Recurrent state buffer, once the forward pass is initialized
    pub fn state_buffer(&self) -> Option<BufferId> {
        match (&self.kind, &self.forward) {
            (LayerKind::Lstm(_), InvocationSlot::Initialized(invocations)) => invocations
                .first()
                .and_then(|step| step.buffer(BufferRole::State)),
            _ => None,
        }
    }

    /// Forget both passes
    pub(crate) fn clear(&mut self) {
        self.forward = InvocationSlot::Uninitialized;
        self.backward = InvocationSlot::Uninitialized;
    }

    pub(crate) fn clear_backward(&mut self) {
        self.backward = InvocationSlot::Uninitialized;
    }
}
