use anyhow::{Context, Result};
use argh::FromArgs;
use chrono::Utc;
use dashmap::DashMap;
use oxilib::config::BlockchainConfig;
use oxilib::crypto::PrivateKey;
use oxilib::fork::ForkManager;
use oxilib::peer::PeerManager;
use oxilib::persistence::SnapshotStore;
use oxilib::types::ChainState;
use static_init::dynamic;
use std::sync::OnceLock;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tracing::{info, warn};

mod handler;
mod sync;
mod util;

/// The chain service: the single serialization point for every state
/// mutation. Whoever holds the write lock applies blocks, reorganizes and
/// admits transactions; readers get a consistent snapshot.
pub struct ChainService {
    pub chain: ChainState,
    pub forks: ForkManager,
}

#[dynamic]
pub static CHAIN: RwLock<ChainService> = RwLock::new(ChainService {
    chain: ChainState::new(),
    forks: ForkManager::new(),
});

/// Outbound sessions, keyed by the peer's node id. Broadcast fanout walks
/// this map; inbound sockets answer on their own connection only.
#[dynamic]
pub static NODES: DashMap<String, TcpStream> = DashMap::new();

/// Peer records: reputation, rate buckets, replay cache, relay dedup.
#[dynamic]
pub static PEER_TABLE: RwLock<PeerManager> = RwLock::new(PeerManager::new(Utc::now()));

static IDENTITY: OnceLock<PrivateKey> = OnceLock::new();
static STORE: OnceLock<SnapshotStore> = OnceLock::new();

pub fn identity() -> &'static PrivateKey {
    IDENTITY.get().expect("BUG: identity initialized at boot")
}

pub fn store() -> &'static SnapshotStore {
    STORE.get().expect("BUG: store initialized at boot")
}

#[derive(FromArgs)]
/// An oxicoin full node
struct Args {
    #[argh(option)]
    /// port number (defaults to NODE_PORT env var or 9000)
    port: Option<u16>,
    #[argh(option)]
    /// data directory (defaults to DATA_DIR env var or ./oxicoin-data)
    data_dir: Option<String>,
    #[argh(positional)]
    /// addresses of initial peers (can also use INITIAL_PEERS env var)
    peers: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    util::init_tracing();

    let config = BlockchainConfig::global();
    let args: Args = argh::from_env();

    // Priority: CLI args > environment vars > defaults
    let port = args.port.unwrap_or(config.node.port);
    let data_dir = args
        .data_dir
        .unwrap_or_else(|| config.node.data_dir.clone());
    let mut peers = args.peers;
    if peers.is_empty() {
        peers = config.node.initial_peers.clone();
    }

    info!(
        network = %config.network.network_id,
        port,
        data_dir = %data_dir,
        "starting oxicoin node"
    );

    let snapshot_store =
        SnapshotStore::open(&data_dir).context("failed to open data directory")?;
    let node_key = snapshot_store
        .load_or_create_identity()
        .context("failed to load node identity")?;
    info!(node_id = %node_key.public_key().fingerprint(), "node identity ready");
    STORE.set(snapshot_store).ok();
    IDENTITY.set(node_key).ok();

    if store().chain_file_exists() {
        util::load_chain().await?;
    } else {
        info!("no local chain state, starting fresh");
    }

    sync::connect_to_peers(&peers).await;
    info!("connected to {} peers", NODES.len());
    if NODES.is_empty() && peers.is_empty() {
        info!("no initial peers provided, starting as a seed node");
    } else {
        sync::initial_sync().await;
    }

    // Start the TCP listener
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "listening");

    // Background maintenance; handles are deliberately detached, the tasks
    // live for the whole process
    tokio::spawn(util::cleanup_mempool());
    tokio::spawn(util::save_chain_periodically());
    tokio::spawn(util::prune_orphans());
    tokio::spawn(util::peer_maintenance());

    loop {
        match listener.accept().await {
            Ok((socket, remote)) => {
                tokio::spawn(handler::handle_connection(socket, remote.to_string()));
            }
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }
}
