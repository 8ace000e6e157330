//! CLI entry point for turbcast.

use std::path::{Path, PathBuf};

use candle_core::Device;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use turbcast_rs::{checkpoint, data, rollout, ConvLstm, DiagnosticsReport, Result, Trainer, TurbcastConfig};

#[derive(Parser)]
#[command(name = "turbcast")]
#[command(about = "ConvLSTM forecasting of VQ-encoded turbulence fields")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a sample configuration file
    Init {
        /// Output path for config file
        #[arg(default_value = "config.yaml")]
        output: String,
        /// Preset (turb, test)
        #[arg(long, default_value = "turb")]
        preset: String,
    },
    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        config: String,
    },
    /// Train on the configured code sequences
    Train {
        /// Path to configuration file
        config: String,
        /// Resume from a checkpoint directory
        #[arg(long)]
        resume: Option<String>,
    },
    /// Roll the model forward over the test codes
    Evaluate {
        /// Path to configuration file
        config: String,
        /// Checkpoint directory (defaults to `<output_dir>/best`)
        #[arg(long)]
        checkpoint: Option<String>,
        /// Where to write metric means as JSON
        #[arg(long)]
        output: Option<String>,
    },
    /// Compare two velocity fields and write a diagnostics report
    Diagnose {
        /// Path to configuration file
        config: String,
        /// Ground-truth velocities (safetensors, key `uvw`, [N, 3, G, G, G])
        #[arg(long)]
        original: String,
        /// Reconstructed velocities (same layout)
        #[arg(long)]
        reconstructed: String,
        /// Report path
        #[arg(long, default_value = "diagnostics.json")]
        output: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let device = Device::cuda_if_available(0)?;

    match cli.command {
        Commands::Init { output, preset } => {
            tracing::info!("Generating config for preset: {}", preset);
            let config = TurbcastConfig::from_preset(&preset)?;
            config.to_file(&output)?;
            println!("✓ Configuration written to: {output}");
        }
        Commands::Validate { config } => {
            tracing::info!("Validating configuration: {}", config);
            let config = TurbcastConfig::from_file(&config)?;
            config.validate()?;
            println!("✓ Configuration is valid");
            println!(
                "  Model: {} layers, {} channels, vocabulary {}",
                config.model.num_layers, config.model.output_size, config.model.num_embedding
            );
            println!(
                "  Window: bptt {} + pred_length {}",
                config.model.bptt, config.model.pred_length
            );
            println!("  Train codes: {}", config.data.train_codes);
        }
        Commands::Train { config, resume } => {
            tracing::info!("Starting training with config: {}", config);
            let config = TurbcastConfig::from_file(&config)?;
            let train = data::load_codes(Path::new(&config.data.train_codes), &device)?;
            let test = if config.data.test_codes.is_empty() {
                None
            } else {
                Some(data::load_codes(Path::new(&config.data.test_codes), &device)?)
            };

            let mut trainer = Trainer::new(config, &device)?;
            if let Some(dir) = resume {
                trainer.resume_from(Path::new(&dir))?;
            }
            let state = trainer.fit(&train, test.as_ref())?;
            println!("✓ Trained {} epochs, best loss {:?}", state.epoch, state.pivot);
        }
        Commands::Evaluate {
            config,
            checkpoint: dir,
            output,
        } => {
            let config = TurbcastConfig::from_file(&config)?;
            config.validate()?;
            let output_dir = PathBuf::from(&config.output_dir);
            let dir = dir.map_or_else(|| checkpoint::best_dir(&output_dir), PathBuf::from);

            let mut model = ConvLstm::load(&config.model, &dir.join(checkpoint::MODEL_FILE), &device)?;
            let codes = data::load_codes(Path::new(&config.data.test_codes), &device)?;
            let result = rollout(&mut model, &codes, &config.evaluation, None)?;

            let path = output.map_or_else(|| output_dir.join("evaluation.json"), PathBuf::from);
            std::fs::write(&path, serde_json::to_string_pretty(&result.metrics.means())?)?;
            println!("✓ {}", result.metrics.summary());
            println!("  Metrics written to: {}", path.display());
        }
        Commands::Diagnose {
            config,
            original,
            reconstructed,
            output,
        } => {
            let config = TurbcastConfig::from_file(&config)?;
            let original = data::load_uvw(Path::new(&original), &device)?;
            let reconstructed = data::load_uvw(Path::new(&reconstructed), &device)?;

            let report = DiagnosticsReport::compute(&original, &reconstructed, &config.diagnostics)?;
            report.save(Path::new(&output))?;
            println!("✓ Diagnostics written to: {output}");
        }
    }

    Ok(())
}
