//! `colorgan` CLI - train the colorization GAN and colorize images with it.
#![recursion_limit = "256"]

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use burn::{
    backend::Autodiff,
    config::Config,
    module::Module,
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use colorgan::{
    training::{train, TrainingConfig},
    utils::colorize_image,
};

#[cfg(not(feature = "ndarray"))]
type MyBackend = burn::backend::Wgpu<f32>;
#[cfg(feature = "ndarray")]
type MyBackend = burn::backend::NdArray<f32>;
type MyAutodiffBackend = Autodiff<MyBackend>;

/// Colorize grayscale images with a pix2pix-style conditional GAN.
#[derive(Parser, Debug)]
#[command(name = "colorgan")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train generator and discriminator on a directory of colour images.
    Train {
        /// Directory searched recursively for jpg/png images.
        #[arg(long, value_name = "DIR")]
        data: PathBuf,

        /// Directory for models, config, state and sample images.
        #[arg(long, default_value = "/tmp/colorgan", value_name = "DIR")]
        artifacts: PathBuf,

        /// Training configuration file; defaults are used when omitted.
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,

        #[arg(long, value_name = "INT")]
        epochs: Option<usize>,

        #[arg(long, value_name = "INT")]
        batch_size: Option<usize>,

        /// Continue from models saved in the artifact directory.
        #[arg(long)]
        resume: bool,
    },

    /// Colorize one image with a trained generator.
    Colorize {
        /// Generator record (`gen.mpk`) written by `train`.
        #[arg(long, value_name = "FILE")]
        weights: PathBuf,

        /// Configuration the generator was trained with.
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,

        #[arg(value_name = "INPUT")]
        input: PathBuf,

        #[arg(value_name = "OUTPUT")]
        output: PathBuf,
    },
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("colorgan={log_level}").into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    if let Err(err) = run(args.command) {
        tracing::error!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

fn load_config(path: Option<&PathBuf>) -> Result<TrainingConfig> {
    match path {
        Some(path) => TrainingConfig::load(path)
            .with_context(|| format!("Failed to read config {}", path.display())),
        None => Ok(TrainingConfig::new()),
    }
}

fn run(command: Command) -> Result<()> {
    let device = Default::default();

    match command {
        Command::Train {
            data,
            artifacts,
            config,
            epochs,
            batch_size,
            resume,
        } => {
            let mut config = load_config(config.as_ref())?;
            if let Some(epochs) = epochs {
                config.epochs = epochs;
            }
            if let Some(batch_size) = batch_size {
                config.batch_size = batch_size;
            }

            train::<MyAutodiffBackend>(config, &data, &artifacts, resume, &device)
                .context("Training failed")?;
        }

        Command::Colorize {
            weights,
            config,
            input,
            output,
        } => {
            let config = load_config(config.as_ref())?;
            config.validate()?;

            let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
            let generator = config
                .model
                .generator_config
                .init::<MyBackend>(&device)
                .load_file(&weights, &recorder, &device)
                .with_context(|| format!("Failed to load generator {}", weights.display()))?;

            let image = image::open(&input)
                .with_context(|| format!("Failed to open {}", input.display()))?;
            let colorized = colorize_image(&generator, &image, config.image_size as u32, &device)?;
            colorized
                .save(&output)
                .with_context(|| format!("Failed to save {}", output.display()))?;

            println!("Colorized {} -> {}", input.display(), output.display());
        }
    }

    Ok(())
}
