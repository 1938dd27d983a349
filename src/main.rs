//! Switchyard -- coordination node for a clustered network controller.
//!
//! Runs a single node against the in-memory mastership store and an
//! inventory seeded from the configuration file, claims mastership of every
//! seeded device, and logs each topology snapshot until SIGTERM/SIGINT.

use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use switchyard::config::{load_config, LoggingConfig};
use switchyard::event::EventDispatcher;
use switchyard::mastership::memory::MemoryMastershipStore;
use switchyard::net::{Link, MastershipRole, NodeId};
use switchyard::topology::{LatestTopology, MemoryInventory};
use switchyard::Controller;

/// Command-line arguments for a Switchyard node.
#[derive(Parser, Debug)]
#[command(
    name = "switchyard",
    version,
    about = "Mastership and topology coordination node"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "switchyard.example.yaml")]
    config: String,

    /// Override the node identifier.
    #[arg(short, long)]
    node_id: Option<String>,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match logging.format.as_str() {
        "json" => builder.json().init(),
        _ => builder.init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(&cli.config)?;
    if let Some(id) = cli.node_id {
        config.node.id = Some(id);
    }
    init_tracing(&config.logging);
    info!("Loaded configuration from {}", cli.config);

    if config.observability.metrics {
        switchyard::metrics::init_metrics(config.observability.metrics_listen)?;
        info!(
            "Prometheus metrics exposed on {}",
            config.observability.metrics_listen
        );
    }

    let node: NodeId = config.node_id();
    let dispatcher = Arc::new(EventDispatcher::new());
    let store = Arc::new(MemoryMastershipStore::new());
    let inventory = Arc::new(MemoryInventory::new(dispatcher.clone()));
    let topology = Arc::new(LatestTopology::new());

    let controller = Controller::new(
        node.clone(),
        &config,
        store,
        dispatcher,
        inventory.clone(),
        inventory.clone(),
        topology,
    );
    controller.start()?;

    for device in &config.inventory.devices {
        inventory.add_device(device.clone());
        if let Err(e) = controller
            .mastership()
            .set_role(&node, device, MastershipRole::Master)
            .await
        {
            warn!(device = %device, error = %e, "Could not claim mastership");
        }
    }
    for link in &config.inventory.links {
        inventory.add_link(Link::new(link.src.clone(), link.dst.clone()));
    }
    info!(
        node = %node,
        devices = config.inventory.devices.len(),
        links = config.inventory.links.len(),
        "Switchyard node running"
    );

    shutdown_signal().await;
    controller.stop().await;
    info!("Switchyard shut down");

    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        },
    }
}
