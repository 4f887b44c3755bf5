//! bmsync CLI
//!
//! Local tooling around the consistency core: hashing, scoring, config
//! validation and store maintenance.

use std::path::PathBuf;
use std::sync::Arc;

use bmsync::{
    error::Result,
    models::{Collection, Config, ValidationVerdict},
    services::{ImageInput, SyncCoordinator, hash_image, score_verdict},
    storage::LocalStorage,
};
use chrono::TimeDelta;
use clap::{Parser, Subcommand};

/// bmsync - BMS telemetry dedup and sync
#[derive(Parser, Debug)]
#[command(
    name = "bmsync",
    version,
    about = "Deduplication and offline-first sync for BMS telemetry"
)]
struct Cli {
    /// Path to the store directory
    #[arg(short, long, default_value = "storage")]
    storage_dir: PathBuf,

    /// Config file (default: {storage_dir}/bmsync.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the content hash of an image file
    Hash {
        file: PathBuf,

        /// Treat the file as base64 text or a data URL
        #[arg(long)]
        base64: bool,
    },

    /// Print the quality report for a verdict shape
    Score {
        #[arg(long, default_value_t = 0)]
        critical: usize,

        #[arg(long, default_value_t = 0)]
        warnings: usize,
    },

    /// Validate the configuration file
    Validate,

    /// Show per-collection metadata of the store
    Info,

    /// Purge tombstones past the retention window
    Gc {
        /// Override the configured retention in days
        #[arg(long)]
        retention_days: Option<u32>,
    },
}

/// Initialize logging from the configured level, or debug when verbose.
fn init_logging(level: &str, verbose: bool) {
    let level = if verbose { "debug" } else { level };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

fn placeholder_verdict(critical: usize, warnings: usize) -> ValidationVerdict {
    ValidationVerdict {
        is_valid: critical == 0,
        critical_errors: (1..=critical).map(|i| format!("critical error {i}")).collect(),
        warnings: (1..=warnings).map(|i| format!("warning {i}")).collect(),
    }
}

/// Main entry point for the CLI application.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| cli.storage_dir.join("bmsync.toml"));
    let config = Config::load_or_default(&config_path);
    init_logging(&config.logging.level, cli.verbose);
    if !matches!(cli.command, Command::Validate) {
        config.validate()?;
    }

    match cli.command {
        Command::Hash { file, base64 } => {
            let input = if base64 {
                ImageInput::Encoded(tokio::fs::read_to_string(&file).await?)
            } else {
                ImageInput::Bytes(tokio::fs::read(&file).await?)
            };
            println!("{}", hash_image(&input)?);
        }

        Command::Score { critical, warnings } => {
            let report = score_verdict(&placeholder_verdict(critical, warnings));
            log::debug!("Quality class: {:?}", report.class());
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Command::Validate => {
            log::info!("Validating {}", config_path.display());
            let config = Config::load(&config_path)?;
            if let Err(e) = config.validate() {
                log::error!("Config validation failed: {}", e);
                return Err(e);
            }
            log::info!("Config OK");
        }

        Command::Info => {
            let storage = Arc::new(LocalStorage::open(&cli.storage_dir).await?);
            let sync = SyncCoordinator::from_config(storage, &config);
            log::info!("Store directory: {}", cli.storage_dir.display());
            for collection in Collection::ALL {
                let meta = sync.get_metadata(collection).await?;
                println!("{}", serde_json::to_string_pretty(&meta)?);
            }
        }

        Command::Gc { retention_days } => {
            let days = retention_days.unwrap_or(config.sync.tombstone_retention_days);
            let storage = Arc::new(LocalStorage::open(&cli.storage_dir).await?);
            let sync = SyncCoordinator::from_config(storage, &config);
            let purged = sync.purge_tombstones(TimeDelta::days(days as i64)).await?;
            log::info!("Purged {} tombstones older than {} days", purged, days);
        }
    }

    Ok(())
}
