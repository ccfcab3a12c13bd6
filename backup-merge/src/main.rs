//! Backup Merge - Main entry point
//!
//! Merges the backup chain ending at a given backup into a single full backup.

use anyhow::{Context, Result};
use backup_merge::catalog::{BackupId, Catalog};
use backup_merge::{config::Config, daemon::shutdown::ShutdownCoordinator, do_merge, utils};
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Backup whose chain is merged
    #[arg(short = 'i', long, value_name = "ID")]
    backup_id: String,

    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Backup catalog root (overrides config)
    #[arg(short = 'B', long = "backup-path", value_name = "CATALOG")]
    catalog: Option<PathBuf>,

    /// Instance name (overrides config)
    #[arg(long)]
    instance: Option<String>,

    /// Number of merge threads (overrides config)
    #[arg(short = 'j', long)]
    threads: Option<usize>,

    /// Log every processed file
    #[arg(long)]
    progress: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        Config::from_file(config_path)?
    } else {
        Config::default()
    };
    config.apply_env_overrides();

    if let Some(path) = args.catalog {
        config.catalog.path = path;
    }
    if let Some(instance) = args.instance {
        config.catalog.instance = instance;
    }
    if let Some(threads) = args.threads {
        config.merge.threads = threads;
    }
    if args.progress {
        config.merge.progress = true;
    }

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level, &config.log.output)?;

    let backup_id: BackupId = args
        .backup_id
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))
        .context("required parameter --backup-id is invalid")?;

    tracing::info!(
        "Starting backup-merge v{} (catalog: {}, instance: {})",
        env!("CARGO_PKG_VERSION"),
        config.catalog.path.display(),
        config.catalog.instance
    );

    let catalog = Catalog::new(&config.catalog.path, &config.catalog.instance);
    let options = config.merge_options();

    // Cancel the merge on SIGINT / SIGTERM
    let shutdown_coordinator = ShutdownCoordinator::new();
    let cancel = shutdown_coordinator.token();
    let signal_handle = tokio::spawn({
        let coordinator = shutdown_coordinator.clone();
        async move { coordinator.wait_for_signal().await }
    });

    let result = tokio::task::spawn_blocking(move || do_merge(&catalog, backup_id, &options, &cancel)).await;
    signal_handle.abort();

    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            if e.is_resumable() {
                tracing::error!("{}; run the merge again to resume", e);
            } else {
                tracing::error!("{}", e);
            }
            Err(e.into())
        }
        Err(e) => {
            tracing::error!("Merge task panicked: {}", e);
            Err(e.into())
        }
    }
}
