mod block_import;
mod bus;
mod chain_sync;
mod color;
mod color_rescan;
mod config;
mod events;
mod keyed_lock;
mod memstore;
mod node;
mod orphans;
mod script;
mod store;
mod telemetry;
mod tx_import;
mod types;

#[cfg(test)]
mod sync_tests;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::info;

use crate::bus::EventBus;
use crate::chain_sync::ChainSync;
use crate::color::{ColorDefinition, ColorStore, EpobcDefinition, MemoryColorStore};
use crate::color_rescan::ColorRescanner;
use crate::events::EventPublisher;
use crate::keyed_lock::KeyedLock;
use crate::memstore::MemoryStore;
use crate::node::{JsonRpcNode, NodeEvent, NodeRpc};
use crate::store::IndexStore;
use crate::telemetry::TelemetryConfig;

#[derive(Parser)]
#[command(name = "chainmirror")]
#[command(about = "Bitcoin chain indexer and mempool synchronizer")]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    telemetry::init_tracing(TelemetryConfig::default())?;
    config::init_global_config(&cli.config)?;
    let cfg = config::get_global_config();

    let network = config::network_from_config(cfg)?;
    let (rpc_url, rpc_user, rpc_pass) = config::rpc_settings(cfg)?;
    let poll_interval = Duration::from_secs(config::poll_interval_secs(cfg));

    info!(%rpc_url, ?network, "starting chainmirror");

    let node: Arc<dyn NodeRpc> = Arc::new(JsonRpcNode::new(rpc_url, rpc_user, rpc_pass));
    let store: Arc<dyn IndexStore> = Arc::new(MemoryStore::new());
    let bus = Arc::new(EventBus::default());
    let publisher = EventPublisher::new(Arc::clone(&bus));
    let lock = KeyedLock::new();

    let sync = ChainSync::new(
        Arc::clone(&node),
        Arc::clone(&store),
        publisher.clone(),
        lock,
        network,
        poll_interval,
    )
    .await?;

    let tip = store.latest().await?;
    publisher.broadcast_status(serde_json::json!({
        "state": "starting",
        "height": tip.height,
        "hash": tip.hash.to_string(),
    }));

    let colors: Arc<dyn ColorStore> = Arc::new(MemoryColorStore::new());
    let definitions: Vec<Arc<dyn ColorDefinition>> =
        vec![Arc::new(EpobcDefinition::new(Arc::clone(&colors)))];
    let rescanner = ColorRescanner::new(Arc::clone(&store), colors, definitions);
    tokio::spawn(Arc::clone(&rescanner).run(Arc::clone(&bus)));

    let (event_tx, event_rx) = mpsc::channel(1024);
    tokio::spawn(node::run_node_watcher(
        Arc::clone(&node),
        event_tx.clone(),
        poll_interval,
    ));

    // Kick one pass immediately instead of waiting for the first poll tick
    let _ = event_tx.send(NodeEvent::Block).await;

    sync.run(event_rx).await;
    Ok(())
}
