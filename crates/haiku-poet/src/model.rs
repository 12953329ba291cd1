//! Model description and JSON model files
//!
//! A model is a vocabulary, an ordered layer list and a set of named
//! tensors. Trained layers `name` read `"{name}.weights"` and
//! `"{name}.biases"`. The network's first input and last output are both
//! one entry per vocabulary symbol.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use haiku_compute::ComputeBackend;
use haiku_engine::{Layer, Network};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{PoetError, Result, Tensor, Vocabulary, WeightError, WeightSource};

/// Current model file format
pub const FORMAT_VERSION: u32 = 1;

/// One layer of a model description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LayerSpec {
    Lstm {
        name: String,
        units: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        clip_to: Option<f32>,
    },
    Linear {
        name: String,
        output: usize,
    },
    Sigmoid,
    Tanh,
    Relu,
    Softmax,
}

impl LayerSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Lstm { .. } => "lstm",
            Self::Linear { .. } => "linear",
            Self::Sigmoid => "sigmoid",
            Self::Tanh => "tanh",
            Self::Relu => "relu",
            Self::Softmax => "softmax",
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Lstm { name, .. } | Self::Linear { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Output size given the input size
    pub fn output_size(&self, input: usize) -> usize {
        match self {
            Self::Lstm { units, .. } => *units,
            Self::Linear { output, .. } => *output,
            _ => input,
        }
    }

    /// Shapes of the trained tensors, `(weights, biases)`
    pub fn tensor_shapes(&self, input: usize) -> Option<(Vec<usize>, Vec<usize>)> {
        match self {
            Self::Lstm { units, .. } => Some((vec![input + units, 4 * units], vec![4 * units])),
            Self::Linear { output, .. } => Some((vec![input, *output], vec![*output])),
            _ => None,
        }
    }
}

/// Layer shape summary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerShape {
    pub kind: &'static str,
    pub name: Option<String>,
    pub input: usize,
    pub output: usize,
}

/// Vocabulary plus layer list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub vocabulary: String,
    pub layers: Vec<LayerSpec>,
}

impl ModelSpec {
    /// Walk the layer list from the vocabulary size
    ///
    /// Fails unless the chain ends in a softmax over the vocabulary.
    pub fn shapes(&self) -> Result<Vec<LayerShape>> {
        let vocabulary = Vocabulary::new(&self.vocabulary)?;
        let mut size = vocabulary.len();
        let mut shapes = Vec::with_capacity(self.layers.len());
        for spec in &self.layers {
            let output = spec.output_size(size);
            shapes.push(LayerShape {
                kind: spec.kind(),
                name: spec.name().map(str::to_string),
                input: size,
                output,
            });
            size = output;
        }

        if size != vocabulary.len() {
            return Err(PoetError::VocabularyMismatch {
                expected: vocabulary.len(),
                actual: size,
            });
        }
        if !matches!(self.layers.last(), Some(LayerSpec::Softmax)) {
            return Err(WeightError::Malformed("last layer must be a softmax".to_string()).into());
        }
        Ok(shapes)
    }

    /// Load every tensor and build the engine layers
    pub fn build_layers(&self, weights: &dyn WeightSource) -> Result<Vec<Layer>> {
        let shapes = self.shapes()?;
        let mut layers = Vec::with_capacity(self.layers.len());

        for (spec, shape) in self.layers.iter().zip(&shapes) {
            let layer = match spec {
                LayerSpec::Lstm {
                    name,
                    units,
                    clip_to,
                } => {
                    let (w, b) = load_pair(weights, name, spec, shape.input)?;
                    Layer::lstm(shape.input, *units, w, b, *clip_to)?.with_name(name.clone())
                }
                LayerSpec::Linear { name, output } => {
                    let (w, b) = load_pair(weights, name, spec, shape.input)?;
                    Layer::linear(shape.input, *output, w, b)?.with_name(name.clone())
                }
                LayerSpec::Sigmoid => Layer::sigmoid(shape.input),
                LayerSpec::Tanh => Layer::tanh(shape.input),
                LayerSpec::Relu => Layer::relu(shape.input),
                LayerSpec::Softmax => Layer::softmax(shape.input),
            };
            layers.push(layer);
        }

        debug!(layers = layers.len(), "Built model layers");
        Ok(layers)
    }

    /// Build the layers and chain them into a network on `backend`
    pub fn build_network(
        &self,
        weights: &dyn WeightSource,
        backend: Box<dyn ComputeBackend>,
    ) -> Result<Network> {
        let layers = self.build_layers(weights)?;
        Ok(Network::builder(backend).layers(layers).build()?)
    }
}

fn load_pair(
    weights: &dyn WeightSource,
    name: &str,
    spec: &LayerSpec,
    input: usize,
) -> Result<(Vec<f32>, Vec<f32>)> {
    let Some((weight_shape, bias_shape)) = spec.tensor_shapes(input) else {
        return Ok((Vec::new(), Vec::new()));
    };

    let weights_name = format!("{name}.weights");
    let w = weights.load_tensor(&weights_name)?;
    w.expect_shape(&weights_name, &weight_shape)?;

    let biases_name = format!("{name}.biases");
    let b = weights.load_tensor(&biases_name)?;
    b.expect_shape(&biases_name, &bias_shape)?;

    Ok((w.data, b.data))
}

/// Model file on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelFile {
    pub version: u32,
    #[serde(flatten)]
    pub spec: ModelSpec,
    pub tensors: BTreeMap<String, Tensor>,
    /// blake3 over tensor names, shapes and data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl ModelFile {
    /// Assemble a model file and stamp its digest
    pub fn from_parts(spec: ModelSpec, tensors: BTreeMap<String, Tensor>) -> Self {
        let digest = Some(digest(&tensors));
        Self {
            version: FORMAT_VERSION,
            spec,
            tensors,
            digest,
        }
    }

    pub fn from_json(json: &str) -> std::result::Result<Self, WeightError> {
        let file: Self = serde_json::from_str(json)?;
        file.validate()?;
        Ok(file)
    }

    pub fn to_json(&self) -> std::result::Result<String, WeightError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load(path: impl AsRef<Path>) -> std::result::Result<Self, WeightError> {
        let path = path.as_ref();
        let file = Self::from_json(&fs::read_to_string(path)?)?;
        info!(
            path = %path.display(),
            tensors = file.tensors.len(),
            layers = file.spec.layers.len(),
            "Loaded model file"
        );
        Ok(file)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> std::result::Result<(), WeightError> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Check version, tensor lengths and digest
    pub fn validate(&self) -> std::result::Result<(), WeightError> {
        if self.version != FORMAT_VERSION {
            return Err(WeightError::UnsupportedVersion(self.version));
        }
        for tensor in self.tensors.values() {
            tensor.check_len()?;
        }
        if let Some(expected) = &self.digest {
            let actual = digest(&self.tensors);
            if *expected != actual {
                return Err(WeightError::DigestMismatch {
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        Ok(())
    }
}

impl WeightSource for ModelFile {
    fn load_tensor(&self, name: &str) -> std::result::Result<Tensor, WeightError> {
        self.tensors
            .get(name)
            .cloned()
            .ok_or_else(|| WeightError::Missing(name.to_string()))
    }
}

fn digest(tensors: &BTreeMap<String, Tensor>) -> String {
    let mut hasher = blake3::Hasher::new();
    for (name, tensor) in tensors {
        hasher.update(name.as_bytes());
        hasher.update(&(tensor.shape.len() as u64).to_le_bytes());
        for &dim in &tensor.shape {
            hasher.update(&(dim as u64).to_le_bytes());
        }
        for &value in &tensor.data {
            hasher.update(&value.to_le_bytes());
        }
    }
    hasher.finalize().to_hex().to_string()
}

/// Where a poet gets its model from
#[derive(Clone)]
pub enum ModelSource {
    /// Read a model file when preparing
    File(PathBuf),
    /// Already in memory
    Memory {
        spec: ModelSpec,
        weights: Arc<dyn WeightSource>,
    },
}

impl ModelSource {
    pub fn load(&self) -> Result<(ModelSpec, Arc<dyn WeightSource>)> {
        match self {
            Self::File(path) => {
                let file = ModelFile::load(path)?;
                let spec = file.spec.clone();
                let weights: Arc<dyn WeightSource> = Arc::new(file);
                Ok((spec, weights))
            }
            Self::Memory { spec, weights } => Ok((spec.clone(), weights.clone())),
        }
    }
}

impl From<ModelFile> for ModelSource {
    fn from(file: ModelFile) -> Self {
        Self::Memory {
            spec: file.spec.clone(),
            weights: Arc::new(file),
        }
    }
}

impl std::fmt::Debug for ModelSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
            Self::Memory { spec, .. } => f
                .debug_struct("Memory")
                .field("layers", &spec.layers.len())
                .field("weights", &"<dyn WeightSource>")
                .finish(),
        }
    }
}
