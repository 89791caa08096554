//! headroom - admission-control gateway.
//!
//! Routes `POST /request` work units to backend nodes while keeping each
//! node under its per-window request and workload limits.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use headroom_core::{
    CapacityTable, Clock, Dispatcher, JournalUsageStore, LoggingForwarder, MemoryUsageStore, SystemClock,
    UsageStore,
};
use headroom_server::{HeadroomServer, NodeSpec, ServerConfig};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "headroom")]
#[command(about = "Rolling-window admission control and load balancing")]
#[command(version)]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long, env = "HEADROOM_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address (overrides the config file)
    #[arg(short, long, env = "HEADROOM_BIND")]
    bind: Option<SocketAddr>,

    /// Usage journal path (overrides the config file)
    #[arg(long, env = "HEADROOM_JOURNAL")]
    journal: Option<PathBuf>,

    /// Extra node as ID=RPM,BPM; may be repeated
    #[arg(long = "node", value_name = "ID=RPM,BPM")]
    nodes: Vec<NodeSpec>,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", env = "HEADROOM_LOG_FORMAT")]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| {
        EnvFilter::try_new("headroom=info,headroom_core=info,headroom_server=info,tower_http=info")
    })?;

    let (text, json) = match format {
        LogFormat::Text => (Some(fmt::layer()), None),
        LogFormat::Json => (None, Some(fmt::layer().json())),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(text)
        .with(json)
        .init();
    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<ServerConfig> {
    let mut config = match &cli.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };

    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }
    if let Some(journal) = &cli.journal {
        config.journal_path = Some(journal.clone());
    }
    config.nodes.extend(cli.nodes.iter().cloned());
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format)?;

    let config = load_config(&cli).context("loading configuration")?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    match config.journal_path.clone() {
        Some(path) => {
            let store = JournalUsageStore::open(&path, config.ledger.retention(), clock.now())
                .await
                .with_context(|| format!("opening usage journal {}", path.display()))?;
            run(config, store, clock).await
        }
        None => {
            info!("No journal configured, usage is kept in memory only");
            let store = MemoryUsageStore::new(config.ledger.retention());
            run(config, store, clock).await
        }
    }
}

async fn run<S: UsageStore>(config: ServerConfig, store: S, clock: Arc<dyn Clock>) -> anyhow::Result<()> {
    let capacity = Arc::new(CapacityTable::new());
    for node in &config.nodes {
        capacity.register(node.id.clone(), node.rpm_limit, node.bpm_limit)?;
    }
    if capacity.is_empty() {
        warn!("No nodes registered, every request will be rejected");
    }

    let dispatcher = Dispatcher::from_config(
        &config.headroom(),
        capacity,
        store,
        Arc::new(LoggingForwarder),
        clock,
    )?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pruner = dispatcher.spawn_pruner(shutdown_rx);

    info!(
        addr = %config.bind_addr,
        nodes = config.nodes.len(),
        journal = ?config.journal_path,
        "Starting headroom"
    );

    let server = HeadroomServer::new(dispatcher);
    let result = server
        .serve_with_shutdown(config.bind_addr, async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
            }
        })
        .await;

    let _ = shutdown_tx.send(true);
    if let Err(err) = pruner.await {
        warn!(error = %err, "Pruner task ended abnormally");
    }

    result.map_err(Into::into)
}
