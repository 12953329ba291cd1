//! The generation runner
//!
//! A [`Poet`] moves between four states:
//!
//! ```text
//! Unprepared ──prepare──▶ Preparing ──ok──▶ Ready ──start──▶ Evaluating
//!     ▲                       │               ▲                  │
//!     └────────failed─────────┘               └──stop / done─────┘
//! ```
//!
//! The loaded network is owned by whichever side is using it: the poet
//! holds it while `Ready`, the generation worker takes it for the length of
//! a run and hands it back when the run ends.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use haiku_compute::{ComputeBackend, ComputeError, GpuBackend, GpuConfig, ReferenceBackend};
use haiku_engine::Network;
use tokio::task::JoinHandle;
use tracing::{Level, debug, info, span, warn};

use crate::{ModelSource, PoetError, Result, Sampler, Vocabulary};

/// Creates the compute backend when the poet prepares
pub type BackendFactory =
    Arc<dyn Fn() -> std::result::Result<Box<dyn ComputeBackend>, ComputeError> + Send + Sync>;

/// Backend factory opening a GPU device
pub fn gpu_backend(config: GpuConfig) -> BackendFactory {
    Arc::new(move || {
        let backend = GpuBackend::request(&config)?;
        Ok(Box::new(backend) as Box<dyn ComputeBackend>)
    })
}

/// Backend factory for the CPU reference backend
pub fn reference_backend() -> BackendFactory {
    Arc::new(|| Ok(Box::new(ReferenceBackend::new()) as Box<dyn ComputeBackend>))
}

/// Generation settings
#[derive(Debug, Clone)]
pub struct PoetConfig {
    /// Initial sampling temperature; `<= 0` is greedy
    pub temperature: f32,
    /// End a run on its own after this many symbols
    pub max_symbols: Option<usize>,
    /// Fixed sampler seed, applied at the start of every run
    pub rng_seed: Option<u64>,
}

impl Default for PoetConfig {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            max_symbols: Some(200),
            rng_seed: None,
        }
    }
}

impl PoetConfig {
    /// Always pick the most likely symbol
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            ..Default::default()
        }
    }

    pub fn with_max_symbols(mut self, max_symbols: Option<usize>) -> Self {
        self.max_symbols = max_symbols;
        self
    }
}

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoetState {
    Unprepared,
    Preparing,
    Ready,
    Evaluating,
}

/// Outcome of one generation run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationSummary {
    /// Symbols emitted
    pub symbols: usize,
    /// Ended by a stop request rather than by `max_symbols`
    pub stopped: bool,
}

struct Engine {
    network: Network,
    vocabulary: Vocabulary,
}

struct Shared {
    model: ModelSource,
    backend: BackendFactory,
    config: PoetConfig,
    temperature: AtomicU32,
    state: Mutex<PoetState>,
    engine: Mutex<Option<Engine>>,
    cancel: Mutex<Option<Arc<AtomicBool>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn set_state(&self, state: PoetState) {
        *lock(&self.state) = state;
    }

    fn temperature(&self) -> f32 {
        f32::from_bits(self.temperature.load(Ordering::Relaxed))
    }
}

/// Character-by-character generator
///
/// Cloning gives another handle to the same poet.
#[derive(Clone)]
pub struct Poet {
    shared: Arc<Shared>,
}

impl Poet {
    pub fn new(model: impl Into<ModelSource>, backend: BackendFactory, config: PoetConfig) -> Self {
        let temperature = AtomicU32::new(config.temperature.to_bits());
        Self {
            shared: Arc::new(Shared {
                model: model.into(),
                backend,
                config,
                temperature,
                state: Mutex::new(PoetState::Unprepared),
                engine: Mutex::new(None),
                cancel: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> PoetState {
        *lock(&self.shared.state)
    }

    /// Ready to start, or already running
    pub fn is_prepared(&self) -> bool {
        matches!(self.state(), PoetState::Ready | PoetState::Evaluating)
    }

    pub fn is_evaluating(&self) -> bool {
        self.state() == PoetState::Evaluating
    }

    pub fn temperature(&self) -> f32 {
        self.shared.temperature()
    }

    /// Change the temperature; a running generation picks it up on its next symbol
    pub fn set_temperature(&self, temperature: f32) {
        self.shared
            .temperature
            .store(temperature.to_bits(), Ordering::Relaxed);
    }

    pub fn config(&self) -> &PoetConfig {
        &self.shared.config
    }

    /// Load the model and open the backend on a blocking worker
    ///
    /// Succeeds immediately if already prepared. On failure the poet returns
    /// to `Unprepared` and may be prepared again.
    pub async fn prepare(&self) -> Result<()> {
        {
            let mut state = lock(&self.shared.state);
            match *state {
                PoetState::Ready | PoetState::Evaluating => return Ok(()),
                PoetState::Preparing => return Err(PoetError::AlreadyPreparing),
                PoetState::Unprepared => *state = PoetState::Preparing,
            }
        }

        // The worker installs its own result, so a dropped `prepare` future
        // still leaves the poet `Ready` or `Unprepared`.
        let shared = self.shared.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let result = load_engine(&shared);
            install_engine(&shared, result)
        })
        .await;

        joined.unwrap_or_else(|e| {
            warn!(error = %e, "Prepare worker failed");
            self.shared.set_state(PoetState::Unprepared);
            Err(PoetError::WorkerFailed(e.to_string()))
        })
    }

    /// Callback form of [`prepare`](Self::prepare)
    ///
    /// Must be called from within a Tokio runtime. `completion` receives
    /// whether the poet ended up prepared.
    pub fn prepare_to_evaluate<F>(&self, completion: F) -> JoinHandle<()>
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let poet = self.clone();
        tokio::spawn(async move {
            let prepared = poet.prepare().await.is_ok();
            completion(prepared);
        })
    }

    /// Start generating from `seed` on a blocking worker
    ///
    /// The seed's known symbols are fed through the network first; unknown
    /// ones are skipped. Must be called from within a Tokio runtime.
    pub fn start_evaluating(&self, seed: &str) -> Result<Generation> {
        let cancel = Arc::new(AtomicBool::new(false));
        let (engine, seed_indices) = {
            let mut state = lock(&self.shared.state);
            match *state {
                PoetState::Ready => {}
                PoetState::Evaluating => return Err(PoetError::AlreadyEvaluating),
                PoetState::Unprepared | PoetState::Preparing => {
                    return Err(PoetError::NotPrepared);
                }
            }

            let mut slot = lock(&self.shared.engine);
            let engine = slot.take().ok_or(PoetError::NotPrepared)?;
            let (indices, skipped) = engine.vocabulary.encode(seed);
            if !skipped.is_empty() {
                warn!(?skipped, "Seed symbols outside the vocabulary were skipped");
            }
            if indices.is_empty() {
                *slot = Some(engine);
                return Err(PoetError::InvalidSeed(seed.to_string()));
            }

            *state = PoetState::Evaluating;
            *lock(&self.shared.cancel) = Some(cancel.clone());
            (engine, indices)
        };

        let (tx, rx) = flume::unbounded();
        let shared = self.shared.clone();
        let worker_cancel = cancel.clone();

        let handle = tokio::task::spawn_blocking(move || {
            let _guard = RunGuard {
                shared: shared.clone(),
            };
            let mut engine = engine;
            let result = generate(&shared, &mut engine, &seed_indices, &worker_cancel, &tx);
            *lock(&shared.engine) = Some(engine);
            result
        });

        Ok(Generation {
            symbols: rx,
            handle,
            cancel,
        })
    }

    /// Ask the running generation to stop after its current step
    ///
    /// Does nothing when no generation is running.
    pub fn stop_evaluating(&self) {
        if let Some(cancel) = lock(&self.shared.cancel).as_ref() {
            debug!("Stop requested");
            cancel.store(true, Ordering::Release);
        }
    }
}

impl std::fmt::Debug for Poet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poet")
            .field("state", &self.state())
            .field("temperature", &self.temperature())
            .field("model", &self.shared.model)
            .finish()
    }
}

/// Returns the poet to `Ready` when a run ends, or to `Unprepared` if the
/// worker lost the engine
struct RunGuard {
    shared: Arc<Shared>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let has_engine = lock(&self.shared.engine).is_some();
        *lock(&self.shared.cancel) = None;
        self.shared.set_state(if has_engine {
            PoetState::Ready
        } else {
            PoetState::Unprepared
        });
    }
}

fn install_engine(shared: &Shared, result: Result<Engine>) -> Result<()> {
    match result {
        Ok(engine) => {
            info!(
                symbols = engine.vocabulary.len(),
                layers = engine.network.layers().len(),
                backend = engine.network.backend().name(),
                "Poet prepared"
            );
            *lock(&shared.engine) = Some(engine);
            shared.set_state(PoetState::Ready);
            Ok(())
        }
        Err(e) => {
            warn!(error = %e, "Poet failed to prepare");
            shared.set_state(PoetState::Unprepared);
            Err(e)
        }
    }
}

fn load_engine(shared: &Shared) -> Result<Engine> {
    let span = span!(Level::DEBUG, "prepare");
    let _enter = span.enter();

    let (spec, weights) = shared.model.load()?;
    let vocabulary = Vocabulary::new(&spec.vocabulary)?;
    let backend = (shared.backend)()?;
    debug!(backend = backend.name(), "Opened compute backend");

    let mut network = spec.build_network(weights.as_ref(), backend)?;
    network.initialize_forward(1)?;

    Ok(Engine {
        network,
        vocabulary,
    })
}

/// One run: prime with the seed, then sample and feed back until stopped
fn generate(
    shared: &Shared,
    engine: &mut Engine,
    seed: &[usize],
    cancel: &AtomicBool,
    symbols: &flume::Sender<char>,
) -> Result<GenerationSummary> {
    let span = span!(Level::DEBUG, "generate", seed_len = seed.len());
    let _enter = span.enter();

    let Engine {
        network,
        vocabulary,
    } = engine;

    network.reset_state()?;
    let mut sampler = Sampler::new(shared.config.rng_seed);
    let mut input = vec![0.0; vocabulary.len()];

    for &index in seed {
        vocabulary.one_hot_into(index, &mut input);
        network.write_input(&input)?;
        network.forward_step()?;
    }

    info!(temperature = shared.temperature(), "Generation started");

    let mut emitted = 0;
    let stopped = loop {
        if cancel.load(Ordering::Acquire) {
            break true;
        }
        if shared.config.max_symbols.is_some_and(|max| emitted >= max) {
            break false;
        }

        let probabilities = network.read_output()?;
        let index = sampler.sample(&probabilities, shared.temperature());
        let symbol = vocabulary
            .symbol(index)
            .ok_or(PoetError::VocabularyMismatch {
                expected: vocabulary.len(),
                actual: probabilities.len(),
            })?;

        if symbols.send(symbol).is_err() {
            // Receiver dropped
            break true;
        }
        emitted += 1;

        vocabulary.one_hot_into(index, &mut input);
        network.write_input(&input)?;
        network.forward_step()?;
    };

    info!(symbols = emitted, stopped, "Generation finished");
    Ok(GenerationSummary {
        symbols: emitted,
        stopped,
    })
}

/// Handle to a running generation
pub struct Generation {
    symbols: flume::Receiver<char>,
    handle: JoinHandle<Result<GenerationSummary>>,
    cancel: Arc<AtomicBool>,
}

impl Generation {
    /// Symbol stream; closes when the run ends
    pub fn symbols(&self) -> &flume::Receiver<char> {
        &self.symbols
    }

    pub async fn next_symbol(&self) -> Option<char> {
        self.symbols.recv_async().await.ok()
    }

    /// Request a stop, same as [`Poet::stop_evaluating`]
    pub fn stop(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    /// Wait for the worker and return how the run ended
    pub async fn finish(self) -> Result<GenerationSummary> {
        self.handle
            .await
            .map_err(|e| PoetError::WorkerFailed(e.to_string()))?
    }

    /// Call `on_symbol` for every symbol, then [`finish`](Self::finish)
    pub async fn for_each<F>(self, mut on_symbol: F) -> Result<GenerationSummary>
    where
        F: FnMut(char),
    {
        while let Ok(symbol) = self.symbols.recv_async().await {
            on_symbol(symbol);
        }
        self.finish().await
    }

    /// Gather all symbols into a string
    pub async fn collect(self) -> Result<(String, GenerationSummary)> {
        let mut text = String::new();
        let summary = self.for_each(|symbol| text.push(symbol)).await?;
        Ok((text, summary))
    }
}
