//! intentmesh node entry point

use anyhow::Result;
use clap::Parser;
use intentmesh::config::NodeConfig;
use intentmesh::identity::IdentityKey;
use intentmesh::observability::init_tracing;
use intentmesh::transport::{
    LazyTransport, LoopbackHub, ReadinessChecker, ReadinessConfig, RunningTransportSource,
    Transport, TransportManager, TransportManagerConfig,
};
use intentmesh::AsyncAutomationManager;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "intentmesh", about = "Decentralized intent auction node")]
struct Args {
    /// Path to the YAML node configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override for the configured data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Override for the configured log level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    let log_level = args
        .log_level
        .unwrap_or_else(|| config.automation.log_level.clone());
    init_tracing(&log_level);

    info!(
        data_dir = %config.data_dir.display(),
        agents = config.agents.len(),
        builders = config.builders.configs.len(),
        "starting intentmesh node"
    );

    let identity = IdentityKey::load_or_generate(&config.data_dir)?;
    info!(peer_id = %identity.peer_id(), "node identity loaded");

    // Single-process deployment: the loopback hub stands in for the
    // gossipsub host, which binds behind the same GossipOverlay trait.
    let hub = LoopbackHub::new();
    let overlay = hub.attach(identity.peer_id());
    let manager = TransportManager::new(
        Arc::clone(&overlay) as _,
        identity.signing_key(),
        TransportManagerConfig {
            gossip: config.transport.gossip_params(),
            router: config.transport.router_config(),
        },
    );
    manager.start();

    let transport = LazyTransport::new(RunningTransportSource::new(Arc::clone(&manager)));
    let readiness = ReadinessChecker::new(
        Arc::clone(&manager) as Arc<dyn Transport>,
        overlay,
        ReadinessConfig {
            max_wait_time: config.automation.async_init.transport_ready_timeout(),
            ..ReadinessConfig::default()
        },
    );

    let automation = AsyncAutomationManager::new(
        config.clone(),
        transport as Arc<dyn Transport>,
        readiness,
    );

    if config.automation.enabled && config.automation.auto_start {
        if let Err(err) = automation.initialize().await {
            error!(error = %err, "automation startup failed");
            return Err(err.into());
        }
    }

    info!("node is up; press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    automation.shutdown().await;
    manager.stop().await;
    info!("node stopped");
    Ok(())
}
