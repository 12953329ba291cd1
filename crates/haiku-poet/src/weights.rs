//! Weight source contract

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::WeightError;

/// A named block of trained values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Tensor {
    /// Create a tensor; `data` must hold exactly `shape.product()` values
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self, WeightError> {
        let tensor = Self { shape, data };
        tensor.check_len()?;
        Ok(tensor)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub(crate) fn check_len(&self) -> Result<(), WeightError> {
        let expected: usize = self.shape.iter().product();
        if expected != self.data.len() {
            return Err(WeightError::Malformed(format!(
                "shape {:?} needs {} values, found {}",
                self.shape,
                expected,
                self.data.len()
            )));
        }
        Ok(())
    }

    /// Fail unless the tensor has exactly `shape`
    pub fn expect_shape(&self, name: &str, shape: &[usize]) -> Result<(), WeightError> {
        if self.shape != shape {
            return Err(WeightError::Shape {
                name: name.to_string(),
                expected: shape.to_vec(),
                actual: self.shape.clone(),
            });
        }
        Ok(())
    }
}

/// Read access to trained tensors
pub trait WeightSource: Send + Sync {
    fn load_tensor(&self, name: &str) -> Result<Tensor, WeightError>;
}

/// Tensors held in a map
#[derive(Debug, Clone, Default)]
pub struct InMemoryWeights {
    tensors: HashMap<String, Tensor>,
}

impl InMemoryWeights {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tensor(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.insert(name, tensor);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }
}

impl WeightSource for InMemoryWeights {
    fn load_tensor(&self, name: &str) -> Result<Tensor, WeightError> {
        self.tensors
            .get(name)
            .cloned()
            .ok_or_else(|| WeightError::Missing(name.to_string()))
    }
}
