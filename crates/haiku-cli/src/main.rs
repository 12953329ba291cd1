//! Haiku CLI - character-level text generation on the GPU
//!
//! Loads a trained model file and streams generated text to stdout.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use haiku_compute::GpuConfig;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

mod commands;

/// Haiku - generate short verse one character at a time
#[derive(Parser)]
#[command(name = "haiku")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate text from a seed
    Generate {
        /// Model file (JSON)
        #[arg(short, long)]
        model: PathBuf,

        /// Seed text fed to the network before sampling
        #[arg(short, long)]
        seed: String,

        /// Sampling temperature; 0 is greedy
        #[arg(short, long, default_value = "0.2")]
        temperature: f32,

        /// Symbols to generate; 0 runs until interrupted
        #[arg(long, default_value = "200")]
        max_symbols: usize,

        /// Compute backend
        #[arg(short, long, value_enum, default_value = "gpu")]
        backend: BackendKind,

        /// Fixed sampler seed
        #[arg(long)]
        rng_seed: Option<u64>,

        /// Prefer an integrated GPU
        #[arg(long)]
        low_power: bool,
    },

    /// Show compute capabilities
    Caps,

    /// Describe a model file
    Inspect {
        /// Model file (JSON)
        #[arg(short, long)]
        model: PathBuf,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum BackendKind {
    /// WGSL kernels through wgpu
    Gpu,
    /// CPU reference kernels
    Reference,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_ansi(!cli.no_color)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Generate {
            model,
            seed,
            temperature,
            max_symbols,
            backend,
            rng_seed,
            low_power,
        } => {
            let gpu = if low_power {
                GpuConfig::low_power()
            } else {
                GpuConfig::default()
            };
            let options = commands::generate::Options {
                temperature,
                max_symbols: (max_symbols > 0).then_some(max_symbols),
                backend,
                rng_seed,
                gpu,
            };
            commands::generate::run(&model, &seed, options).await?;
        }

        Commands::Caps => {
            commands::caps::run();
        }

        Commands::Inspect { model } => {
            commands::inspect::run(&model)?;
        }
    }

    Ok(())
}
