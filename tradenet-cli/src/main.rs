use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tradenet_core::config::Config;
use tradenet_core::core_node::{Collaborators, DataNode};
use tradenet_core::core_router::{TcpTransport, TransportEvent};
use tradenet_core::logging::{init_logging_with_config, LogConfig, LogLevel};

/// Buffered transport events before readers are back-pressured
const EVENT_BUFFER: usize = 1024;

#[derive(Parser, Debug)]
#[command(name = "tradenet")]
#[command(author, version, about = "Replicated offer and trade data node", long_about = None)]
struct Args {
    /// Override the configured log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Enable JSON formatted logging
    #[arg(long, global = true)]
    json_logs: bool,

    /// Configuration file (TOML); TRADENET_* variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Restore state and serve peers until Ctrl-C / SIGTERM
    Run {
        /// Listen address, overrides node.listen_address
        #[arg(long)]
        listen: Option<String>,

        /// Extra peers to dial, in addition to node.bootstrap_peers
        #[arg(long = "peer")]
        peers: Vec<String>,
    },
    /// Restore state and print what it holds
    Inspect {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Write the default configuration
    InitConfig {
        #[arg(default_value = "tradenet.toml")]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Drop sequence entries past their retention and write a snapshot
    PurgeSequences,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Command::InitConfig { path, force } = &args.command {
        return init_config(&expand(path), *force);
    }

    let config_path = args.config.as_deref().map(expand);
    let mut config = Config::load(config_path.as_deref()).context("failed to load configuration")?;
    config.persistence.data_dir = expand(&config.persistence.data_dir);

    let mut log_config = LogConfig::from_settings(&config.logging);
    if let Some(level) = &args.log_level {
        log_config.level = LogLevel::from_str(level)?;
    }
    if args.json_logs {
        log_config = log_config.json_format(true);
    }
    init_logging_with_config(log_config)?;

    if config.metrics.enabled {
        tradenet_core::metrics::init_metrics();
        tradenet_core::core_router::metrics::init_metrics();
        if let Some(addr) = &config.metrics.prometheus_address {
            let addr: SocketAddr = addr.parse().context("invalid prometheus_address")?;
            PrometheusBuilder::new()
                .with_http_listener(addr)
                .install()
                .context("failed to install Prometheus exporter")?;
            info!(addr = %addr, "Prometheus exporter listening");
        }
    }

    match args.command {
        Command::Run { listen, peers } => run(config, listen, peers).await,
        Command::Inspect { json } => inspect(config, json),
        Command::PurgeSequences => purge_sequences(config),
        Command::InitConfig { .. } => Ok(()),
    }
}

fn expand(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(&raw).into_owned())
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    Config::default().save_to_file(path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

/// A node over TCP whose transport events are not consumed; for offline commands
fn offline_node(config: Config) -> DataNode {
    let (event_tx, _) = mpsc::channel(1);
    DataNode::new(config, Collaborators::standard(TcpTransport::new(event_tx)))
}

async fn run(config: Config, listen: Option<String>, peers: Vec<String>) -> Result<()> {
    let (event_tx, mut event_rx) = mpsc::channel(EVENT_BUFFER);
    let transport = TcpTransport::new(event_tx);
    let node = Arc::new(DataNode::new(
        config.clone(),
        Collaborators::standard(transport.clone()),
    ));

    // Restore completes before any connection is accepted
    node.start().await.context("failed to start node")?;

    let pump_node = node.clone();
    let pump = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            dispatch(&pump_node, event).await;
        }
    });

    if let Some(addr) = listen.or(config.node.listen_address.clone()) {
        transport
            .listen(&addr)
            .await
            .with_context(|| format!("failed to listen on {}", addr))?;
    }
    for peer in config.node.bootstrap_peers.iter().chain(peers.iter()) {
        match transport.dial(peer).await {
            Ok(id) => info!(peer = %id, "Connected to bootstrap peer"),
            Err(e) => warn!(peer = %peer, error = %e, "Failed to reach bootstrap peer"),
        }
    }

    tradenet_core::shutdown::wait_for_signal().await;

    node.shutdown().await?;
    transport.close_all();
    pump.abort();
    info!("Node stopped");
    Ok(())
}

async fn dispatch(node: &DataNode, event: TransportEvent) {
    let router = node.router();
    match event {
        TransportEvent::Connected(peer) => {
            if let Err(e) = router.on_peer_connected(&peer).await {
                warn!(peer = %peer, error = %e, "Failed to send initial data");
            }
        }
        TransportEvent::Envelope(peer, envelope) => {
            let outcome = router.on_receive(&peer, envelope).await;
            debug!(peer = %peer, ?outcome, "Envelope handled");
        }
        TransportEvent::DecodeError(peer, error) => {
            router.on_decode_error(&peer, error).await;
        }
        TransportEvent::Disconnected(peer) => {
            router.on_peer_disconnected(&peer).await;
        }
    }
}

fn inspect(config: Config, json: bool) -> Result<()> {
    let node = offline_node(config);
    let report = node.restore().context("failed to restore state")?;

    let by_kind = node.store().count_by_kind();
    let by_currency = node.aggregator().count_by_currency();

    if json {
        let kinds: serde_json::Map<String, serde_json::Value> = by_kind
            .iter()
            .map(|(kind, count)| (kind.as_str().to_string(), (*count).into()))
            .collect();
        let summary = serde_json::json!({
            "data_dir": node.config().persistence.data_dir,
            "records": report.records,
            "records_by_kind": kinds,
            "append_only": report.appended,
            "sequences": report.sequences,
            "trades_by_currency": by_currency,
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("Data directory: {}", node.config().persistence.data_dir.display());
    println!("Mutable records: {}", report.records);
    for (kind, count) in by_kind {
        println!("  {:<22}{}", kind.as_str(), count);
    }
    println!("Append-only payloads: {}", report.appended);
    for (currency, count) in by_currency {
        println!("  {:<22}{}", currency, count);
    }
    println!("Sequence entries: {}", report.sequences);
    Ok(())
}

fn purge_sequences(config: Config) -> Result<()> {
    let node = offline_node(config);
    let report = node.restore().context("failed to restore state")?;

    let purged = node.purge_expired_sequences();
    node.snapshot().context("failed to write snapshot")?;

    info!(purged, remaining = report.sequences - purged, "Sequence map purged");
    println!("Purged {} of {} sequence entries", purged, report.sequences);
    Ok(())
}
