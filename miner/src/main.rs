//! Standalone proof-of-work miner.
//!
//! Talks to a node over the signed message protocol: fetch a template,
//! grind nonces in batches on a worker thread, poll the template's validity
//! between batches, and submit when a nonce lands under the target. A tip
//! change at the node invalidates the template and the worker restarts on
//! the fresh one; partial work is discarded.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::Parser;
use oxilib::config::BlockchainConfig;
use oxilib::crypto::{PrivateKey, PublicKey};
use oxilib::network::{HelloInfo, Message, SignedMessage};
use oxilib::types::Block;
use oxilib::util::Saveable;
use oxilib::U256;
use tokio::net::TcpStream;
use tokio::time::{self, Duration};
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Node address to connect to
    #[arg(short, long, env = "MINER_NODE_ADDRESS")]
    address: Option<String>,

    /// Public key file for receiving rewards
    #[arg(short, long, env = "MINER_PUBLIC_KEY")]
    public_key_file: Option<String>,
}

struct Session {
    stream: TcpStream,
    identity: PrivateKey,
}

impl Session {
    async fn connect(address: &str) -> Result<Self> {
        let config = BlockchainConfig::global();
        let identity = PrivateKey::new_key();
        let mut stream = TcpStream::connect(address)
            .await
            .with_context(|| format!("failed to connect to {address}"))?;

        // Introduce ourselves; miners carry no chain of their own
        let hello = HelloInfo {
            node_id: identity.public_key().fingerprint(),
            listen_port: 0,
            protocol_version: config.peer.protocol_version,
            network_id: config.network.network_id.clone(),
            genesis: None,
            tip_height: 0,
            tip_hash: None,
            best_work: U256::zero(),
        };
        SignedMessage::seal(Message::Hello(hello), &identity, Utc::now())?
            .send_async(&mut stream)
            .await?;
        let (answer, _) =
            SignedMessage::receive_async(&mut stream, config.peer.envelope_recovery).await?;
        let verified = answer
            .verify(Utc::now())
            .map_err(|rejection| anyhow!("node handshake rejected: {rejection}"))?;
        let Message::Hello(node_info) = verified.payload else {
            return Err(anyhow!("node answered handshake with something else"));
        };
        info!(node = %node_info.node_id, height = node_info.tip_height, "connected to node");
        Ok(Session { stream, identity })
    }

    async fn send(&mut self, message: Message) -> Result<()> {
        SignedMessage::seal(message, &self.identity, Utc::now())?
            .send_async(&mut self.stream)
            .await?;
        Ok(())
    }

    async fn request(&mut self, message: Message) -> Result<Message> {
        let config = BlockchainConfig::global();
        self.send(message).await?;
        let (answer, _) =
            SignedMessage::receive_async(&mut self.stream, config.peer.envelope_recovery).await?;
        let verified = answer
            .verify(Utc::now())
            .map_err(|rejection| anyhow!("node envelope rejected: {rejection}"))?;
        Ok(verified.payload)
    }
}

/// Worker-thread nonce grinder. Between batches it picks up the newest
/// template, so a tip change preempts the current search.
fn mine_worker(
    template_rx: flume::Receiver<Block>,
    mined_tx: flume::Sender<Block>,
    batch_size: usize,
) {
    let mut current: Option<Block> = None;
    loop {
        // Block when idle, otherwise drain to the newest template
        if current.is_none() {
            match template_rx.recv() {
                Ok(template) => current = Some(template),
                Err(_) => return,
            }
        }
        while let Ok(newer) = template_rx.try_recv() {
            current = Some(newer);
        }

        let block = current.as_mut().expect("BUG: template set above");
        let mut found = false;
        for _ in 0..batch_size {
            if block.header.hash().matches_target(block.header.target) {
                found = true;
                break;
            }
            block.header.nonce = block.header.nonce.wrapping_add(1);
        }
        if found {
            info!(height = block.header.height, nonce = block.header.nonce, "block mined");
            if mined_tx.send(block.clone()).is_err() {
                return;
            }
            current = None;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let config = BlockchainConfig::global();
    let cli = Cli::parse();

    let address = cli
        .address
        .unwrap_or_else(|| config.mining.node_address.clone());
    let key_file = cli
        .public_key_file
        .unwrap_or_else(|| config.mining.public_key_file.clone());
    let pubkey = PublicKey::load_from_file(&key_file)
        .with_context(|| format!("failed to load public key from {key_file}"))?;

    info!(%address, "starting miner");
    let mut session = Session::connect(&address).await?;

    let (template_tx, template_rx) = flume::unbounded::<Block>();
    let (mined_tx, mined_rx) = flume::unbounded::<Block>();
    let batch_size = config.mining.mining_batch_size;
    std::thread::spawn(move || mine_worker(template_rx, mined_tx, batch_size));

    let mut current_template: Option<Block> = None;
    let mut interval = time::interval(Duration::from_secs(
        config.mining.template_fetch_interval_secs,
    ));
    loop {
        interval.tick().await;

        // Submit anything the worker found since the last tick
        while let Ok(mined) = mined_rx.try_recv() {
            info!(height = mined.header.height, "submitting mined block");
            session.send(Message::SubmitTemplate(mined)).await?;
            current_template = None;
        }

        // Keep the worker on a template that still extends the tip
        match &current_template {
            None => {
                match session.request(Message::FetchTemplate(pubkey)).await? {
                    Message::Template(mut template) => {
                        template.header.timestamp = Utc::now();
                        debug!(height = template.header.height, "fetched template");
                        current_template = Some(template.clone());
                        template_tx
                            .send(template)
                            .map_err(|_| anyhow!("mining worker died"))?;
                    }
                    other => warn!(?other, "unexpected answer to template fetch"),
                }
            }
            Some(template) => {
                match session
                    .request(Message::ValidateTemplate(template.clone()))
                    .await?
                {
                    Message::TemplateValidity(true) => {}
                    Message::TemplateValidity(false) => {
                        debug!("tip moved, discarding current template");
                        current_template = None;
                    }
                    other => warn!(?other, "unexpected answer to template validation"),
                }
            }
        }
    }
}
