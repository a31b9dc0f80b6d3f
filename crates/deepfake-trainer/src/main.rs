//! CLI entry point for the deepfake video classifier.
//!
//! Subcommands:
//!   index     -- Scan the frame folders and report what would be trained on
//!   train     -- Split, train with early stopping, then score the test split
//!   evaluate  -- Score a saved checkpoint on the test split of its manifest

use anyhow::Context;
use clap::{Parser, Subcommand};
use deepfake_core::{load_config, ClassCounts, ExperimentConfig, LoggingConfig};
use deepfake_data::{index_videos, split_dataset, split_sizes, DatasetSplit, SplitManifest};
use deepfake_model::{fetch_backbone_weights, select_device};
use deepfake_trainer::training::evaluate::evaluate_checkpoint;
use deepfake_trainer::training::trainer;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "deepfake-train", about = "Deepfake video classifier training pipeline")]
struct Cli {
    /// YAML experiment config; every field is optional.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Dataset root containing `real/` and `fake/`.
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Best-model checkpoint path.
    #[arg(long, global = true)]
    checkpoint: Option<PathBuf>,

    /// Split, shuffle and augmentation seed.
    #[arg(long, global = true)]
    seed: Option<u64>,

    /// Run on CPU even when a GPU backend is compiled in.
    #[arg(long, global = true)]
    cpu: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Index the dataset and print class counts and split sizes.
    Index,

    /// Train a detector and evaluate the best checkpoint on the test split.
    Train {
        /// Maximum training epochs.
        #[arg(long)]
        epochs: Option<usize>,

        /// Videos per mini-batch.
        #[arg(long)]
        batch_size: Option<usize>,

        /// Initial AdamW learning rate.
        #[arg(long)]
        lr: Option<f64>,

        /// Start the backbone from random weights.
        #[arg(long)]
        no_pretrained: bool,
    },

    /// Evaluate the checkpoint on the test split recorded next to it.
    Evaluate,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(1);
        }
    };
    init_logging(&config.logging);

    if let Err(e) = run(cli, config).await {
        tracing::error!("{e:#}");
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

/// Config file (or defaults) with command-line overrides applied, validated.
fn build_config(cli: &Cli) -> anyhow::Result<ExperimentConfig> {
    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ExperimentConfig::default(),
    };

    if let Some(root) = &cli.root {
        config.data.root = root.clone();
    }
    if let Some(checkpoint) = &cli.checkpoint {
        config.training.checkpoint_path = checkpoint.clone();
    }
    if let Some(seed) = cli.seed {
        config.training.seed = seed;
    }
    if let Command::Train {
        epochs,
        batch_size,
        lr,
        no_pretrained,
    } = &cli.command
    {
        if let Some(epochs) = epochs {
            config.training.max_epochs = *epochs;
        }
        if let Some(batch_size) = batch_size {
            config.training.batch_size = *batch_size;
        }
        if let Some(lr) = lr {
            config.training.learning_rate = *lr;
        }
        if *no_pretrained {
            config.model.pretrained.enabled = false;
        }
    }

    config.validate()?;
    Ok(config)
}

/// Install the global subscriber. `RUST_LOG` takes precedence over the
/// configured level.
fn init_logging(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(cli: Cli, config: ExperimentConfig) -> anyhow::Result<()> {
    match cli.command {
        Command::Index => {
            let samples = index_videos(&config.data)?;
            let counts = ClassCounts::from_samples(&samples);
            let sizes = split_sizes(
                samples.len(),
                config.data.train_fraction,
                config.data.val_fraction,
            );
            println!(
                "Videos: {} ({} real, {} fake) | split train={} val={} test={}",
                counts.total(),
                counts.real,
                counts.fake,
                sizes.train,
                sizes.val,
                sizes.test
            );
        }

        Command::Train { .. } => {
            let device = select_device(cli.cpu);
            let samples = index_videos(&config.data)?;
            let split = split_dataset(samples, &config.data, config.training.seed);
            let pretrained = fetch_backbone_weights(&config.model.pretrained).await?;

            let outcome = trainer::train(&config, &split, &device, pretrained.as_deref())?;
            if let Some(best) = outcome.best_epoch {
                info!(
                    best_epoch = best,
                    best_val_acc = outcome.best_val_accuracy,
                    epochs = outcome.history.len(),
                    stopped_early = outcome.stopped_early,
                    "Training finished"
                );
            }

            let metrics = evaluate_checkpoint(&config, &split.test, &device)?;
            println!("\nFINAL TEST ACCURACY: {:.2}%", metrics.accuracy * 100.0);
            println!("Model saved to: {}", outcome.checkpoint_path.display());
        }

        Command::Evaluate => {
            let device = select_device(cli.cpu);
            let manifest_path = config.training.split_manifest_path();
            let manifest = SplitManifest::load(&manifest_path).with_context(|| {
                format!(
                    "no split manifest next to {}; run `train` first",
                    config.training.checkpoint_path.display()
                )
            })?;
            let samples = index_videos(&config.data)?;
            let split = DatasetSplit::from_manifest(samples, &manifest)?;

            let metrics = evaluate_checkpoint(&config, &split.test, &device)?;
            println!("TEST ACCURACY: {:.2}% | {metrics}", metrics.accuracy * 100.0);
        }
    }
    Ok(())
}
