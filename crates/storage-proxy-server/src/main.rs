//! Storage proxy binary.
//!
//! ## Usage
//!
//! ```bash
//! # Run the proxy workers until interrupted
//! storage-proxy run -f storage-proxy.toml
//!
//! # Parse and validate a configuration, then print it back
//! storage-proxy check-config -f storage-proxy.toml
//!
//! # Initialize every volume once and report capabilities and usage
//! storage-proxy inspect -f storage-proxy.toml [--json]
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use storage_proxy_server::config::{Config, env_overrides};
use storage_proxy_server::logging;
use storage_proxy_server::pidfile::PidFile;
use storage_proxy_server::worker::{self, WorkerPool, WorkerSettings};
use storage_proxy_types::FsUsage;

/// Storage proxy for virtual folders.
#[derive(Parser, Debug)]
#[command(name = "storage-proxy")]
#[command(about = "Serves virtual folders out of configured storage volumes")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the worker units and serve until interrupted
    Run {
        /// Configuration file
        #[arg(short = 'f', long, default_value = "storage-proxy.toml")]
        config: PathBuf,
    },

    /// Validate a configuration file
    CheckConfig {
        /// Configuration file
        #[arg(short = 'f', long, default_value = "storage-proxy.toml")]
        config: PathBuf,
    },

    /// Initialize each volume and print its capabilities and usage
    Inspect {
        /// Configuration file
        #[arg(short = 'f', long, default_value = "storage-proxy.toml")]
        config: PathBuf,

        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Run { config } => run(&config).await,
        Command::CheckConfig { config } => check_config(&config),
        Command::Inspect { config, json } => inspect(&config, json).await,
    }
}

async fn run(path: &Path) -> Result<()> {
    let config = Config::load(path)?;
    logging::init(config.default_log_level(), config.logging.format)?;
    for (var, value) in env_overrides() {
        tracing::info!(var, value = %value, "configuration overridden from environment");
    }

    tracing::info!(
        node_id = %config.storage_proxy.node_id,
        workers = config.storage_proxy.num_proc,
        volumes = config.volume.len(),
        "starting storage proxy"
    );

    let _pid_file = config
        .storage_proxy
        .pid_file
        .as_ref()
        .map(PidFile::create)
        .transpose()?;

    // Workers own their runtimes; this one only waits for the signal
    let pool = WorkerPool::spawn(
        config.storage_proxy.num_proc,
        WorkerSettings::from_config(&config),
    )?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");

    pool.stop()?;
    tracing::info!("storage proxy stopped");
    Ok(())
}

fn check_config(path: &Path) -> Result<()> {
    let config = Config::load(path)?;

    println!("{}: ok", path.display());
    println!("  node-id:         {}", config.storage_proxy.node_id);
    println!("  num-proc:        {}", config.storage_proxy.num_proc);
    println!("  scandir-limit:   {}", config.storage_proxy.scandir_limit);
    println!("  max-upload-size: {}", config.storage_proxy.max_upload_size);
    println!("  session-expire:  {}", config.storage_proxy.session_expire);
    for (name, info) in &config.volume {
        println!("  volume {name}: {} at {}", info.backend, info.root().display());
    }
    Ok(())
}

async fn inspect(path: &Path, json: bool) -> Result<()> {
    let config = Config::load(path)?;
    logging::init("warn", config.logging.format)?;

    let registry = worker::start_registry(&WorkerSettings::from_config(&config)).await?;

    let mut report = Vec::new();
    for summary in registry.list().await {
        let volume = registry.get(&summary.name)?;
        let usage: FsUsage = volume
            .get_fs_usage()
            .await
            .with_context(|| format!("Failed to read usage of volume {}", summary.name))?;
        report.push((summary, usage));
    }
    registry.shutdown_all().await?;

    if json {
        let volumes: Vec<_> = report
            .iter()
            .map(|(summary, usage)| {
                serde_json::json!({
                    "name": summary.name,
                    "backend": summary.backend,
                    "capabilities": summary.capabilities.iter().map(|c| c.to_string()).collect::<Vec<_>>(),
                    "capacity_bytes": usage.capacity_bytes,
                    "used_bytes": usage.used_bytes,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&volumes)?);
        return Ok(());
    }

    for (summary, usage) in &report {
        println!(
            "{:<16} {:<8} {:>16} / {:<16} [{}]",
            summary.name,
            summary.backend,
            usage.used_bytes,
            usage.capacity_bytes,
            summary.capabilities
        );
    }
    Ok(())
}
