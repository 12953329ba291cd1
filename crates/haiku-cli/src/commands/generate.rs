//! Generate command

use std::io::Write;
use std::path::Path;

use haiku_compute::{GpuConfig, GpuContext};
use haiku_poet::{ModelSource, Poet, PoetConfig, gpu_backend, reference_backend};
use tracing::{info, warn};

use crate::BackendKind;

pub struct Options {
    pub temperature: f32,
    pub max_symbols: Option<usize>,
    pub backend: BackendKind,
    pub rng_seed: Option<u64>,
    pub gpu: GpuConfig,
}

pub async fn run(
    model: &Path,
    seed: &str,
    options: Options,
) -> Result<(), Box<dyn std::error::Error>> {
    let factory = match options.backend {
        BackendKind::Gpu => {
            // No CPU fallback: refuse before touching the model
            if GpuContext::enumerate_adapters().is_empty() {
                return Err("no GPU compute adapter available (pass --backend reference to \
                            use the CPU reference kernels)"
                    .into());
            }
            gpu_backend(options.gpu)
        }
        BackendKind::Reference => {
            warn!("Using the CPU reference backend");
            reference_backend()
        }
    };

    let config = PoetConfig {
        temperature: options.temperature,
        max_symbols: options.max_symbols,
        rng_seed: options.rng_seed,
    };

    info!("Loading model from {}", model.display());
    let poet = Poet::new(ModelSource::File(model.to_path_buf()), factory, config);
    poet.prepare().await?;

    let generation = poet.start_evaluating(seed)?;
    let mut stdout = std::io::stdout();
    write!(stdout, "{seed}")?;
    stdout.flush()?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    loop {
        tokio::select! {
            symbol = generation.next_symbol() => match symbol {
                Some(symbol) => {
                    write!(stdout, "{symbol}")?;
                    stdout.flush()?;
                }
                None => break,
            },
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                poet.stop_evaluating();
            }
        }
    }

    let summary = generation.finish().await?;
    writeln!(stdout)?;
    info!(symbols = summary.symbols, stopped = summary.stopped, "Done");

    Ok(())
}
