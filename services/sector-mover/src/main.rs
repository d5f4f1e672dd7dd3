// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Sector migration tool
//!
//! Moves sealed, cache and unsealed sector artifacts from source storage
//! nodes to destination storage nodes, within per-node and per-path
//! concurrency ceilings. Units already present at a destination are
//! skipped, and SIGINT or SIGTERM stops admission and waits for running
//! copies to finish.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use sector_mover::config::{MigrationConfig, expand_home};
use sector_mover::context::MigrationContext;
use sector_mover::lock::InstanceLock;
use sector_mover::metrics;
use sector_mover::unit::UnitStatus;

const DEFAULT_CONFIG: &str = "~/sector-mover.yaml";

#[derive(Parser)]
#[command(name = "sector-mover")]
#[command(about = "Migrate sector artifacts between storage nodes", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy every pending unit to the destinations
    Copy {
        /// Path to the YAML configuration file
        #[arg(long, default_value = DEFAULT_CONFIG, env = "SECTOR_MOVER_CONFIG")]
        config: PathBuf,
    },

    /// Validate the configuration and list what a copy would transfer
    Check {
        /// Path to the YAML configuration file
        #[arg(long, default_value = DEFAULT_CONFIG, env = "SECTOR_MOVER_CONFIG")]
        config: PathBuf,
    },
}

fn print_version() {
    let version = env!("CARGO_PKG_VERSION");
    let name = env!("CARGO_PKG_NAME");
    let buildstamp = option_env!("STAMP").unwrap_or("no-STAMP");
    println!("{} {} ({})", name, version, buildstamp);
}

fn load_config(path: &Path) -> Result<MigrationConfig> {
    let path = expand_home(path);
    let config = MigrationConfig::from_file(&path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    info!(config = %path.display(), "configuration loaded");
    Ok(config)
}

/// Cancel `stop` on SIGINT or SIGTERM.
fn spawn_signal_handler(stop: CancellationToken) {
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "Failed to register SIGTERM handler");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!(error = %e, "Failed to wait for SIGINT");
                    return;
                }
                stop.cancel();
                return;
            }
        };

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!(error = %e, "Failed to wait for SIGINT");
                    return;
                }
                info!("Received SIGINT, stopping");
            }
            _ = sigterm.recv() => info!("Received SIGTERM, stopping"),
        }
        stop.cancel();
    });
}

async fn copy(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let _lock = InstanceLock::acquire(&config.lock_file).context("Failed to take instance lock")?;

    metrics::register_metrics();

    let stop = CancellationToken::new();
    spawn_signal_handler(stop.clone());

    let context = MigrationContext::new(config, stop).context("Failed to set up migration")?;
    let summary = context.run().await?;

    if summary.interrupted {
        info!(
            done = summary.done,
            waiting = summary.waiting,
            "migration interrupted; run again to continue"
        );
    } else {
        info!(done = summary.done, bytes = summary.bytes, "migration complete");
    }
    Ok(())
}

async fn check(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let context = MigrationContext::new(config, CancellationToken::new())
        .context("Failed to set up migration")?;

    let units = context.discover().await?;
    let mut pending_bytes = 0u64;
    for unit in &units {
        match unit.status {
            UnitStatus::Done => println!(
                "present  {}/{} at {}",
                unit.kind,
                unit.id,
                unit.dest_root
                    .as_deref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default()
            ),
            _ => {
                pending_bytes += unit.total_bytes;
                println!(
                    "copy     {}/{} from {} ({}, {} bytes)",
                    unit.kind,
                    unit.id,
                    unit.source_node,
                    unit.size_class,
                    unit.total_bytes
                );
            }
        }
    }
    let pending = units
        .iter()
        .filter(|u| u.status != UnitStatus::Done)
        .count();
    println!(
        "{} units, {} to copy ({} bytes), {} already present",
        units.len(),
        pending,
        pending_bytes,
        units.len() - pending
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "sector_mover=info".to_string()),
        ))
        .init();

    print_version();

    match cli.command {
        Commands::Copy { config } => copy(&config).await,
        Commands::Check { config } => check(&config).await,
    }
}
