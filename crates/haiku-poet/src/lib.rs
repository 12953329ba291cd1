//! Haiku Poet - character-level text generation
//!
//! Loads a trained model (vocabulary, layer list, named tensors) into a
//! [`haiku_engine::Network`] and drives it one symbol at a time:
//!
//! ```text
//! seed ─▶ one-hot ─▶ forward step ─▶ probabilities ─▶ sample ─▶ symbol
//!               ▲                                                 │
//!               └─────────────────────────────────────────────────┘
//! ```
//!
//! [`Poet`] owns the lifecycle (`Unprepared → Preparing → Ready ⇄
//! Evaluating`) and runs both model loading and the generation loop on
//! blocking worker threads. Symbols stream back through a [`Generation`].

pub mod error;
pub mod model;
pub mod poet;
pub mod sampler;
pub mod vocabulary;
pub mod weights;

// Re-exports
pub use error::{PoetError, Result, WeightError};
pub use model::{FORMAT_VERSION, LayerShape, LayerSpec, ModelFile, ModelSource, ModelSpec};
pub use poet::{
    BackendFactory, Generation, GenerationSummary, Poet, PoetConfig, PoetState, gpu_backend,
    reference_backend,
};
pub use sampler::Sampler;
pub use vocabulary::Vocabulary;
pub use weights::{InMemoryWeights, Tensor, WeightSource};
