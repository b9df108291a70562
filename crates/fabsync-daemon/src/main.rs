//! Fabric-sync admin daemon - Main entry point
//!
//! Wires the commissioning engine to the controller process and keeps the
//! bridge subscription running.

mod backend;
mod config;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use backend::SocketBackend;
use fabsync_core::AdminStore;
use fabsync_engine::SyncEngine;

#[derive(Parser, Debug)]
#[command(name = "fabsync")]
#[command(about = "Fabric-sync admin daemon for cross-fabric device commissioning")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "fabsync.toml")]
    config: PathBuf,

    /// Controller socket path (overrides the config file)
    #[arg(short, long)]
    socket: Option<String>,

    /// Admin state file (overrides the config file)
    #[arg(long)]
    state: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Fabsync v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config = config::load_config(&args.config)?;
    if let Some(socket) = args.socket {
        config.daemon.socket = socket;
    }
    if let Some(state) = args.state {
        config.daemon.state_path = state;
    }

    info!(
        socket = %config.daemon.socket,
        state_path = %config.daemon.state_path,
        "Configuration loaded"
    );

    // Connect to the controller process
    let backend = SocketBackend::connect(config.daemon.socket.as_ref()).await?;

    // Build the engine from persisted admin state
    let store = AdminStore::new(&config.daemon.state_path);
    let engine = SyncEngine::new(
        config.to_engine_config(),
        store,
        backend.clone(),
        backend.clone(),
        backend.clone(),
    )?;

    // Start consuming the subscription feed
    tokio::spawn(backend.clone().run(engine.clone()));

    // Pair the configured bridge unless one is already bound
    if let Some(bridge) = &config.bridge {
        if engine.is_sync_ready().await {
            info!(
                node_id = ?engine.bridge_node_id().await,
                "Bridge already paired, resuming subscription"
            );
            engine.subscribe_bridge().await;
        } else {
            info!(node_id = bridge.node_id, host = %bridge.host, "Pairing remote bridge");
            engine
                .pair_bridge(bridge.node_id, bridge.setup_pin, &bridge.host, bridge.port)
                .await?;
        }
    } else if !engine.is_sync_ready().await {
        warn!("No bridge configured or paired; device sync is idle");
    }

    // Report admission outcomes
    let mut outcomes = engine.subscribe();
    tokio::spawn(async move {
        while let Ok(outcome) = outcomes.recv().await {
            match outcome.result {
                Ok(node_id) => info!(
                    endpoint_id = outcome.endpoint_id,
                    node_id, "Device synced"
                ),
                Err(e) => warn!(
                    endpoint_id = outcome.endpoint_id,
                    error = %e,
                    "Device admission failed"
                ),
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    Ok(())
}
