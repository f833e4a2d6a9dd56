use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};

mod commands;
mod logging;
mod settings;

use settings::CliSettings;

#[derive(Parser)]
#[command(name = "xtts", about = "Operator tooling for the XTTS-v2 GPT decoder")]
struct Cli {
    /// Log level used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Settings file to read instead of ~/.config/xtts/config.toml
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

/// Flags shared by every subcommand; unset flags fall back to the settings
/// file.
#[derive(Args, Debug, Default)]
struct Common {
    /// Decoder config.json
    #[arg(long)]
    config: Option<PathBuf>,

    /// Safetensors files or checkpoint directories (repeatable)
    #[arg(long = "weights", num_args = 1..)]
    weights: Vec<PathBuf>,

    /// Compute dtype: f32, f16 or bf16
    #[arg(long)]
    dtype: Option<String>,

    /// Number of pipeline stages
    #[arg(long)]
    num_stages: Option<usize>,
}

impl Common {
    fn into_settings(self) -> CliSettings {
        CliSettings {
            config: self.config,
            weights: (!self.weights.is_empty()).then_some(self.weights),
            dtype: self.dtype,
            num_stages: self.num_stages,
            ..Default::default()
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Validate a decoder config and print its derived sizes
    Inspect {
        #[command(flatten)]
        common: Common,
    },

    /// Bind a checkpoint against the decoder's parameter table
    CheckWeights {
        #[command(flatten)]
        common: Common,

        /// Check only this stage (default: every stage)
        #[arg(long)]
        stage_id: Option<usize>,
    },

    /// Prime with zero conditioning and decode greedily
    Smoke {
        #[command(flatten)]
        common: Common,

        /// Conditioning rows to prime with
        #[arg(long)]
        cond_rows: Option<usize>,

        /// Incremental decode steps after priming
        #[arg(long)]
        steps: Option<usize>,
    },

    /// Merge the given flags into the settings file
    SaveSettings {
        #[command(flatten)]
        common: Common,

        #[arg(long)]
        cond_rows: Option<usize>,

        #[arg(long)]
        steps: Option<usize>,
    },
}

/// Settings file values overlaid with the flags given on the command line.
fn resolve(settings: Option<&Path>, given: &CliSettings) -> anyhow::Result<CliSettings> {
    let mut resolved = match settings {
        Some(path) => CliSettings::load_from(path)?,
        None => CliSettings::load(),
    };
    resolved.merge(given);
    Ok(resolved)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level, logging::LogFormat::from_env())?;
    let settings = cli.settings.as_deref();

    match cli.command {
        Command::Inspect { common } => {
            commands::inspect(&resolve(settings, &common.into_settings())?)
        }
        Command::CheckWeights { common, stage_id } => {
            commands::check_weights(&resolve(settings, &common.into_settings())?, stage_id)
        }
        Command::Smoke {
            common,
            cond_rows,
            steps,
        } => {
            let resolved = resolve(settings, &CliSettings {
                cond_rows,
                steps,
                ..common.into_settings()
            })?;
            let tokens = commands::smoke(&resolved)?;
            println!("{tokens:?}");
            Ok(())
        }
        Command::SaveSettings {
            common,
            cond_rows,
            steps,
        } => {
            let given = CliSettings {
                cond_rows,
                steps,
                ..common.into_settings()
            };
            let path = commands::save_settings(&given, settings)?;
            println!("settings written to {}", path.display());
            Ok(())
        }
    }
}
