use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde::{Deserialize, Serialize};

use bbfs_logging::LogConfig;
use bbfs_net::{BulkRegistry, DataService};
use bbfs_storage_service::{DaemonConfig, DaemonContext, StorageService};

/// bbfs storage daemon
#[derive(Parser, Debug)]
#[command(name = "bbfs-daemon", version, about)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Chunk store root, overriding the configuration file
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Dump the default configuration and exit
    #[arg(long)]
    dump_default_config: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BinConfig {
    daemon: DaemonConfig,
    #[serde(default)]
    log: LogConfig,
}

fn default_config() -> BinConfig {
    BinConfig {
        daemon: DaemonConfig {
            root_path: "/var/lib/bbfs/chunks".into(),
            chunk_size: 512 * 1024,
            host_id: 0,
            host_size: 1,
            tasklet_workers: 8,
            enable_stats: false,
            enable_chunkstats: false,
        },
        log: LogConfig::default(),
    }
}

fn load_config(args: &Args) -> anyhow::Result<BinConfig> {
    match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file '{}'", path.display()))?;
            toml::from_str(&text)
                .with_context(|| format!("failed to parse config file '{}'", path.display()))
        }
        None => Ok(default_config()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.dump_default_config {
        print!("{}", toml::to_string_pretty(&default_config())?);
        return Ok(());
    }

    let mut config = load_config(&args)?;
    if let Some(root) = args.root {
        config.daemon.root_path = root;
    }
    let _log_guard = bbfs_logging::init_logging(&config.log);

    tracing::info!(
        root = %config.daemon.root_path.display(),
        host_id = config.daemon.host_id,
        host_size = config.daemon.host_size,
        chunk_size = config.daemon.chunk_size,
        "starting bbfs daemon"
    );

    let transport = BulkRegistry::new();
    let ctx = Arc::new(
        DaemonContext::new(config.daemon, transport)
            .context("failed to initialize daemon context")?,
    );
    let service = StorageService::new(Arc::clone(&ctx));

    let stat = service
        .chunk_stat()
        .await
        .context("failed to stat chunk storage")?;
    tracing::info!(
        chunk_total = stat.chunk_total,
        chunk_free = stat.chunk_free,
        "chunk storage online"
    );

    // TODO: bind a network transport to the service; only the in-process
    // endpoint exists today.
    tracing::info!("bbfs daemon ready");
    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for shutdown signal")?;

    tracing::info!("shutting down");
    ctx.stats().report();
    Ok(())
}
