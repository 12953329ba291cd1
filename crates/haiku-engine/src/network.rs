//! Sequential network executor

use haiku_compute::{BufferId, ComputeBackend, Invocation};
use tracing::{Level, debug, info, span};

use crate::{BackwardInvocationBuilder, EngineError, ForwardInvocationBuilder, Layer, Result};

/// Buffers of one initialized pass
#[derive(Debug)]
struct PassBuffers {
    batch_size: usize,
    /// One buffer per layer boundary, `layers.len() + 1` in total
    boundaries: Vec<BufferId>,
    /// Everything allocated for the pass, boundaries included
    owned: Vec<BufferId>,
}

/// An ordered chain of layers bound to a compute backend
pub struct Network {
    layers: Vec<Layer>,
    backend: Box<dyn ComputeBackend>,
    forward: Option<PassBuffers>,
    backward: Option<PassBuffers>,
}

impl Network {
    /// Create a network builder
    pub fn builder(backend: Box<dyn ComputeBackend>) -> NetworkBuilder {
        NetworkBuilder::new(backend)
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn layer(&self, index: usize) -> Option<&Layer> {
        self.layers.get(index)
    }

    pub fn input_size(&self) -> usize {
        self.layers.first().map_or(0, Layer::input_size)
    }

    pub fn output_size(&self) -> usize {
        self.layers.last().map_or(0, Layer::output_size)
    }

    /// Batch size of the initialized forward pass
    pub fn batch_size(&self) -> Option<usize> {
        self.forward.as_ref().map(|pass| pass.batch_size)
    }

    pub fn backend(&self) -> &dyn ComputeBackend {
        self.backend.as_ref()
    }

    /// Buffers currently live on the backend
    pub fn live_buffers(&self) -> usize {
        self.backend.live_buffers()
    }

    /// Allocate activation buffers and build every layer's forward invocations
    ///
    /// Calling again releases the previous forward and backward buffers
    /// first, so the buffer count only depends on the latest batch size.
    pub fn initialize_forward(&mut self, batch_size: usize) -> Result<()> {
        if batch_size == 0 {
            return Err(EngineError::InvalidBatchSize);
        }

        let span = span!(Level::DEBUG, "initialize_forward", batch_size);
        let _enter = span.enter();

        self.release_backward();
        self.release_forward();

        let mut owned = Vec::new();
        match self.build_forward(batch_size, &mut owned) {
            Ok(boundaries) => {
                info!(
                    layers = self.layers.len(),
                    batch_size,
                    buffers = owned.len(),
                    backend = self.backend.name(),
                    "Forward pass initialized"
                );
                self.forward = Some(PassBuffers {
                    batch_size,
                    boundaries,
                    owned,
                });
                Ok(())
            }
            Err(e) => {
                self.release(&owned);
                for layer in &mut self.layers {
                    layer.clear();
                }
                Err(e)
            }
        }
    }

    fn build_forward(
        &mut self,
        batch_size: usize,
        owned: &mut Vec<BufferId>,
    ) -> Result<Vec<BufferId>> {
        let mut boundaries = Vec::with_capacity(self.layers.len() + 1);
        if let Some(first) = self.layers.first() {
            let id = self.backend.allocate_buffer(first.input_size() * batch_size)?;
            owned.push(id);
            boundaries.push(id);
        }
        for layer in &self.layers {
            let id = self.backend.allocate_buffer(layer.output_size() * batch_size)?;
            owned.push(id);
            boundaries.push(id);
        }

        for (index, layer) in self.layers.iter_mut().enumerate() {
            let mut builder = ForwardInvocationBuilder::new(
                self.backend.as_mut(),
                owned,
                batch_size,
                (layer.input_size(), layer.output_size()),
                boundaries[index],
                boundaries[index + 1],
            );
            layer.initialize_forward(&mut builder)?;
        }

        Ok(boundaries)
    }

    /// Allocate delta buffers and build every layer's backward invocations
    ///
    /// `batch_size` must match the initialized forward pass.
    pub fn initialize_backward(&mut self, batch_size: usize) -> Result<()> {
        let forward = self.forward.as_ref().ok_or(EngineError::NotInitialized)?;
        if forward.batch_size != batch_size {
            return Err(EngineError::BatchSizeMismatch {
                forward: forward.batch_size,
                backward: batch_size,
            });
        }
        let inputs = forward.boundaries.clone();

        let span = span!(Level::DEBUG, "initialize_backward", batch_size);
        let _enter = span.enter();

        self.release_backward();

        let mut owned = Vec::new();
        match self.build_backward(batch_size, &inputs, &mut owned) {
            Ok(deltas) => {
                info!(layers = self.layers.len(), batch_size, "Backward pass initialized");
                self.backward = Some(PassBuffers {
                    batch_size,
                    boundaries: deltas,
                    owned,
                });
                Ok(())
            }
            Err(e) => {
                self.release(&owned);
                for layer in &mut self.layers {
                    layer.clear_backward();
                }
                Err(e)
            }
        }
    }

    fn build_backward(
        &mut self,
        batch_size: usize,
        inputs: &[BufferId],
        owned: &mut Vec<BufferId>,
    ) -> Result<Vec<BufferId>> {
        let mut deltas = Vec::with_capacity(self.layers.len() + 1);
        if let Some(first) = self.layers.first() {
            let id = self.backend.allocate_buffer(first.input_size() * batch_size)?;
            owned.push(id);
            deltas.push(id);
        }
        for layer in &self.layers {
            let id = self.backend.allocate_buffer(layer.output_size() * batch_size)?;
            owned.push(id);
            deltas.push(id);
        }

        for (index, layer) in self.layers.iter_mut().enumerate() {
            let mut builder = BackwardInvocationBuilder::new(
                self.backend.as_mut(),
                owned,
                batch_size,
                (layer.input_size(), layer.output_size()),
                deltas[index + 1],
                inputs[index],
                deltas[index],
            );
            layer.initialize_backward(&mut builder)?;
        }

        Ok(deltas)
    }

    /// Run every layer's forward invocations in layer order and wait
    pub fn forward_step(&mut self) -> Result<()> {
        if self.forward.is_none() {
            return Err(EngineError::NotInitialized);
        }
        let invocations: Vec<&Invocation> = self
            .layers
            .iter()
            .flat_map(|layer| layer.forward_invocations())
            .collect();

        debug!(invocations = invocations.len(), "Forward step");
        let completion = self.backend.dispatch(&invocations)?;
        self.backend.wait(completion)?;
        Ok(())
    }

    /// Run every layer's backward invocations in reverse layer order and wait
    pub fn backward_step(&mut self) -> Result<()> {
        if self.backward.is_none() {
            return Err(EngineError::NotInitialized);
        }
        let invocations: Vec<&Invocation> = self
            .layers
            .iter()
            .rev()
            .flat_map(|layer| layer.backward_invocations())
            .collect();

        debug!(invocations = invocations.len(), "Backward step");
        let completion = self.backend.dispatch(&invocations)?;
        self.backend.wait(completion)?;
        Ok(())
    }

    /// Buffer feeding the first layer
    pub fn input_buffer(&self) -> Option<BufferId> {
        self.forward.as_ref().and_then(|pass| pass.boundaries.first().copied())
    }

    /// Buffer written by the last layer
    pub fn output_buffer(&self) -> Option<BufferId> {
        self.forward.as_ref().and_then(|pass| pass.boundaries.last().copied())
    }

    pub fn write_input(&mut self, values: &[f32]) -> Result<()> {
        let id = self.input_buffer().ok_or(EngineError::NotInitialized)?;
        self.backend.write_buffer(id, values)?;
        Ok(())
    }

    pub fn read_output(&mut self) -> Result<Vec<f32>> {
        let id = self.output_buffer().ok_or(EngineError::NotInitialized)?;
        self.read_buffer(id)
    }

    /// Seed the gradient arriving at the last layer
    pub fn write_output_deltas(&mut self, values: &[f32]) -> Result<()> {
        let id = self
            .backward
            .as_ref()
            .and_then(|pass| pass.boundaries.last().copied())
            .ok_or(EngineError::NotInitialized)?;
        self.backend.write_buffer(id, values)?;
        Ok(())
    }

    /// Gradient produced for the network input
    pub fn read_input_deltas(&mut self) -> Result<Vec<f32>> {
        let id = self
            .backward
            .as_ref()
            .and_then(|pass| pass.boundaries.first().copied())
            .ok_or(EngineError::NotInitialized)?;
        self.read_buffer(id)
    }

    pub fn read_buffer(&mut self, id: BufferId) -> Result<Vec<f32>> {
        Ok(self.backend.read_buffer(id)?)
    }

    /// Zero the recurrent state of every layer that has one
    pub fn reset_state(&mut self) -> Result<()> {
        if self.forward.is_none() {
            return Err(EngineError::NotInitialized);
        }
        for id in self.layers.iter().filter_map(Layer::state_buffer) {
            let len = self
                .backend
                .buffer_len(id)
                .ok_or(EngineError::MissingBuffer(id))?;
            self.backend.write_buffer(id, &vec![0.0; len])?;
        }
        Ok(())
    }

    fn release(&mut self, ids: &[BufferId]) {
        for &id in ids {
            self.backend.release_buffer(id);
        }
    }

    fn release_forward(&mut self) {
        if let Some(pass) = self.forward.take() {
            self.release(&pass.owned);
            for layer in &mut self.layers {
                layer.clear();
            }
        }
    }

    fn release_backward(&mut self) {
        if let Some(pass) = self.backward.take() {
            self.release(&pass.owned);
            for layer in &mut self.layers {
                layer.clear_backward();
            }
        }
    }
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network")
            .field("layers", &self.layers.len())
            .field("backend", &self.backend.name())
            .field("batch_size", &self.batch_size())
            .finish()
    }
}

/// Network builder
pub struct NetworkBuilder {
    backend: Box<dyn ComputeBackend>,
    layers: Vec<Layer>,
}

impl NetworkBuilder {
    pub fn new(backend: Box<dyn ComputeBackend>) -> Self {
        Self {
            backend,
            layers: Vec::new(),
        }
    }

    /// Append a layer
    pub fn layer(mut self, layer: Layer) -> Self {
        self.layers.push(layer);
        self
    }

    /// Append several layers
    pub fn layers(mut self, layers: impl IntoIterator<Item = Layer>) -> Self {
        self.layers.extend(layers);
        self
    }

    /// Check the chain and build the network
    pub fn build(self) -> Result<Network> {
        if self.layers.is_empty() {
            return Err(EngineError::EmptyNetwork);
        }

        for (index, layer) in self.layers.iter().enumerate() {
            if layer.input_size() == 0 || layer.output_size() == 0 {
                return Err(EngineError::ZeroSize { layer: index });
            }
        }

        for (index, pair) in self.layers.windows(2).enumerate() {
            if pair[0].output_size() != pair[1].input_size() {
                return Err(EngineError::ShapeMismatch {
                    layer: index + 1,
                    expected: pair[0].output_size(),
                    actual: pair[1].input_size(),
                });
            }
        }

        Ok(Network {
            layers: self.layers,
            backend: self.backend,
            forward: None,
            backward: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use haiku_compute::{BufferRole, DispatchTrace, ReferenceBackend};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn reference() -> (Box<dyn ComputeBackend>, DispatchTrace) {
        let backend = ReferenceBackend::new();
        let trace = backend.trace();
        (Box::new(backend), trace)
    }

    fn sigmoid(x: f32) -> f32 {
        1.0 / (1.0 + (-x).exp())
    }

    #[test]
    fn test_empty_network_rejected() {
        let (backend, _) = reference();
        assert!(matches!(
            Network::builder(backend).build(),
            Err(EngineError::EmptyNetwork)
        ));
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let (backend, _) = reference();
        let result = Network::builder(backend)
            .layer(Layer::sigmoid(4))
            .layer(Layer::relu(5))
            .build();
        assert!(matches!(
            result,
            Err(EngineError::ShapeMismatch {
                layer: 1,
                expected: 4,
                actual: 5,
            })
        ));
    }

    #[test]
    fn test_zero_size_rejected() {
        let (backend, _) = reference();
        let result = Network::builder(backend).layer(Layer::tanh(0)).build();
        assert!(matches!(result, Err(EngineError::ZeroSize { layer: 0 })));
    }

    #[test]
    fn test_step_before_init_is_error() {
        let (backend, _) = reference();
        let mut network = Network::builder(backend)
            .layer(Layer::sigmoid(2))
            .build()
            .unwrap();
        assert!(matches!(
            network.forward_step(),
            Err(EngineError::NotInitialized)
        ));
        assert!(matches!(
            network.write_input(&[0.0, 0.0]),
            Err(EngineError::NotInitialized)
        ));
    }

    #[test]
    fn test_invalid_batch_size() {
        let (backend, _) = reference();
        let mut network = Network::builder(backend)
            .layer(Layer::sigmoid(2))
            .build()
            .unwrap();
        assert!(matches!(
            network.initialize_forward(0),
            Err(EngineError::InvalidBatchSize)
        ));
    }

    #[test]
    fn test_chain_executes_in_order_and_shares_buffers() {
        let (backend, trace) = reference();
        let mut network = Network::builder(backend)
            .layer(Layer::relu(4).with_name("a"))
            .layer(Layer::tanh(4).with_name("b"))
            .layer(Layer::sigmoid(4).with_name("c"))
            .build()
            .unwrap();
        network.initialize_forward(1).unwrap();
        network.write_input(&[-1.0, 0.0, 1.0, 2.0]).unwrap();
        network.forward_step().unwrap();

        assert_eq!(
            trace.kernel_names(),
            vec!["relu_forward", "tanh_forward", "sigmoid_forward"]
        );

        let [a, b, c] = [0, 1, 2].map(|i| &network.layers()[i].forward_invocations()[0]);
        assert_eq!(a.buffer(BufferRole::Output), b.buffer(BufferRole::Input));
        assert_eq!(b.buffer(BufferRole::Output), c.buffer(BufferRole::Input));
        assert_eq!(c.buffer(BufferRole::Output), network.output_buffer());

        let output = network.read_output().unwrap();
        for (x, y) in [-1.0f32, 0.0, 1.0, 2.0].iter().zip(&output) {
            assert_relative_eq!(*y, sigmoid(x.max(0.0).tanh()), epsilon = 1e-5);
        }
    }

    #[test]
    fn test_reinitialize_does_not_leak() {
        let (backend, _) = reference();
        let mut network = Network::builder(backend)
            .layer(Layer::linear(3, 2, vec![0.5; 6], vec![0.1; 2]).unwrap())
            .layer(Layer::sigmoid(2))
            .build()
            .unwrap();

        network.initialize_forward(4).unwrap();
        let live = network.live_buffers();
        let first: Vec<usize> = network
            .layers()
            .iter()
            .map(|layer| layer.forward_invocations()[0].width())
            .collect();

        network.initialize_forward(4).unwrap();
        assert_eq!(network.live_buffers(), live);
        let second: Vec<usize> = network
            .layers()
            .iter()
            .map(|layer| layer.forward_invocations()[0].width())
            .collect();
        assert_eq!(first, second);
        for layer in network.layers() {
            assert_eq!(layer.forward_invocations().len(), 1);
        }
    }

    #[test]
    fn test_reinitialized_network_computes_same_output() {
        let (backend, _) = reference();
        let mut network = Network::builder(backend)
            .layer(Layer::linear(2, 2, vec![1.0, -1.0, 0.5, 2.0], vec![0.0, 1.0]).unwrap())
            .layer(Layer::tanh(2))
            .build()
            .unwrap();

        let run = |network: &mut Network| {
            network.initialize_forward(1).unwrap();
            network.write_input(&[0.3, -0.7]).unwrap();
            network.forward_step().unwrap();
            network.read_output().unwrap()
        };
        let first = run(&mut network);
        let second = run(&mut network);
        assert_eq!(first, second);
    }

    #[test]
    fn test_sigmoid_backward_matches_derivative() {
        let mut rng = StdRng::seed_from_u64(7);
        let size = 32;
        let batch_size = 4;
        let inputs: Vec<f32> = (0..size * batch_size)
            .map(|_| rng.gen_range(-10.0..=10.0))
            .collect();

        let (backend, trace) = reference();
        let mut network = Network::builder(backend)
            .layer(Layer::sigmoid(size))
            .build()
            .unwrap();
        network.initialize_forward(batch_size).unwrap();
        network.initialize_backward(batch_size).unwrap();

        network.write_input(&inputs).unwrap();
        network.forward_step().unwrap();
        network.write_output_deltas(&vec![1.0; size * batch_size]).unwrap();
        network.backward_step().unwrap();

        assert_eq!(trace.kernel_names(), vec!["sigmoid_forward", "sigmoid_backward"]);
        let deltas = network.read_input_deltas().unwrap();
        for (x, dx) in inputs.iter().zip(&deltas) {
            let s = sigmoid(*x);
            assert_relative_eq!(*dx, s * (1.0 - s), epsilon = 1e-5);
        }
    }

    #[test]
    fn test_tanh_backward_matches_derivative() {
        let mut rng = StdRng::seed_from_u64(13);
        let size = 24;
        let batch_size = 3;
        let count = size * batch_size;
        let inputs: Vec<f32> = (0..count).map(|_| rng.gen_range(-10.0..=10.0)).collect();
        let output_deltas: Vec<f32> = (0..count).map(|_| rng.gen_range(-2.0..=2.0)).collect();

        let (backend, trace) = reference();
        let mut network = Network::builder(backend)
            .layer(Layer::tanh(size))
            .build()
            .unwrap();
        network.initialize_forward(batch_size).unwrap();
        network.initialize_backward(batch_size).unwrap();

        network.write_input(&inputs).unwrap();
        network.forward_step().unwrap();
        network.write_output_deltas(&output_deltas).unwrap();
        network.backward_step().unwrap();

        assert_eq!(trace.kernel_names(), vec!["tanh_forward", "tanh_backward"]);
        let outputs = network.read_output().unwrap();
        let deltas = network.read_input_deltas().unwrap();
        for (i, x) in inputs.iter().enumerate() {
            let t = x.tanh();
            assert_relative_eq!(outputs[i], t, epsilon = 1e-5);
            assert_relative_eq!(deltas[i], output_deltas[i] * (1.0 - t * t), epsilon = 1e-5);
        }
    }

    #[test]
    fn test_relu_backward_gates_on_positive_input() {
        let (backend, _) = reference();
        let mut network = Network::builder(backend)
            .layer(Layer::relu(6))
            .build()
            .unwrap();
        network.initialize_forward(1).unwrap();
        network.initialize_backward(1).unwrap();

        network.write_input(&[-2.0, -0.0, 0.0, 1e-6, 0.5, 3.0]).unwrap();
        network.forward_step().unwrap();
        network
            .write_output_deltas(&[1.0, 2.0, 3.0, 4.0, 5.0, -6.0])
            .unwrap();
        network.backward_step().unwrap();

        assert_eq!(
            network.read_output().unwrap(),
            vec![0.0, 0.0, 0.0, 1e-6, 0.5, 3.0]
        );
        assert_eq!(
            network.read_input_deltas().unwrap(),
            vec![0.0, 0.0, 0.0, 4.0, 5.0, -6.0]
        );
    }

    #[test]
    fn test_backward_runs_in_reverse_order() {
        let (backend, trace) = reference();
        let mut network = Network::builder(backend)
            .layer(Layer::relu(3))
            .layer(Layer::linear(3, 2, vec![1.0; 6], vec![0.0; 2]).unwrap())
            .layer(Layer::tanh(2))
            .build()
            .unwrap();
        network.initialize_forward(2).unwrap();
        network.initialize_backward(2).unwrap();

        network.write_input(&[1.0, -1.0, 2.0, 0.5, 0.5, -3.0]).unwrap();
        network.forward_step().unwrap();
        trace.clear();
        network.write_output_deltas(&[1.0; 4]).unwrap();
        network.backward_step().unwrap();

        assert_eq!(
            trace.kernel_names(),
            vec!["tanh_backward", "linear_backward", "relu_backward"]
        );

        // Each layer consumes the delta the next one produced
        let layers = network.layers();
        let tanh = &layers[2].backward_invocations()[0];
        let linear = &layers[1].backward_invocations()[0];
        let relu = &layers[0].backward_invocations()[0];
        assert_eq!(
            tanh.buffer(BufferRole::InputDeltas),
            linear.buffer(BufferRole::OutputDeltas)
        );
        assert_eq!(
            linear.buffer(BufferRole::InputDeltas),
            relu.buffer(BufferRole::OutputDeltas)
        );

        // Negative inputs get no gradient through the relu
        let deltas = network.read_input_deltas().unwrap();
        assert_eq!(deltas[1], 0.0);
        assert_eq!(deltas[5], 0.0);
        assert!(deltas[0] > 0.0);
    }

    #[test]
    fn test_backward_batch_size_must_match() {
        let (backend, _) = reference();
        let mut network = Network::builder(backend)
            .layer(Layer::sigmoid(2))
            .build()
            .unwrap();
        assert!(matches!(
            network.initialize_backward(1),
            Err(EngineError::NotInitialized)
        ));
        network.initialize_forward(2).unwrap();
        assert!(matches!(
            network.initialize_backward(3),
            Err(EngineError::BatchSizeMismatch {
                forward: 2,
                backward: 3,
            })
        ));
    }

    #[test]
    fn test_backward_unsupported_releases_buffers() {
        let (backend, _) = reference();
        let mut network = Network::builder(backend)
            .layer(Layer::sigmoid(3))
            .layer(Layer::softmax(3))
            .build()
            .unwrap();
        network.initialize_forward(1).unwrap();
        let live = network.live_buffers();

        assert!(matches!(
            network.initialize_backward(1),
            Err(EngineError::BackwardUnsupported("softmax"))
        ));
        assert_eq!(network.live_buffers(), live);
        assert!(!network.layers()[0].is_backward_initialized());
    }

    #[test]
    fn test_lstm_state_persists_and_resets() {
        let (backend, _) = reference();
        // One input, one unit, recurrent weight on the candidate gate
        let weights = vec![0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0];
        let mut network = Network::builder(backend)
            .layer(Layer::lstm(1, 1, weights, vec![0.0; 4], None).unwrap())
            .build()
            .unwrap();
        network.initialize_forward(1).unwrap();

        let step = |network: &mut Network| {
            network.write_input(&[1.0]).unwrap();
            network.forward_step().unwrap();
            network.read_output().unwrap()[0]
        };

        let first = step(&mut network);
        let second = step(&mut network);
        assert_ne!(first, second);

        network.reset_state().unwrap();
        let after_reset = step(&mut network);
        assert_relative_eq!(after_reset, first, epsilon = 1e-6);
    }

    #[test]
    fn test_softmax_output_is_distribution() {
        let (backend, _) = reference();
        let mut network = Network::builder(backend)
            .layer(Layer::linear(2, 3, vec![1.0, 0.0, -1.0, 0.5, 0.5, 0.5], vec![0.0; 3]).unwrap())
            .layer(Layer::softmax(3))
            .build()
            .unwrap();
        network.initialize_forward(2).unwrap();
        network.write_input(&[1.0, 2.0, -1.0, 0.0]).unwrap();
        network.forward_step().unwrap();

        let output = network.read_output().unwrap();
        for row in output.chunks(3) {
            assert_relative_eq!(row.iter().sum::<f32>(), 1.0, epsilon = 1e-5);
        }
    }
}
