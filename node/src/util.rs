use anyhow::{Context, Result};
use chrono::Utc;
use oxilib::config::BlockchainConfig;
use oxilib::error::NodeError;
use oxilib::fork::BlockDisposition;
use oxilib::network::{Message, MessageKind, SignedMessage, VerifiedEnvelope};
use oxilib::peer::{GoodBehaviour, Misbehaviour};
use oxilib::types::Block;
use tokio::net::TcpStream;
use tokio::time::{self, Duration};
use tracing::{debug, info, warn};

use crate::ChainService;

pub fn init_tracing() {
    tracing_subscriber::fmt::init();
}

/// Load persisted chain state into the service and warm-start the mempool
/// from the optional dump.
pub async fn load_chain() -> Result<()> {
    info!("chain state exists, loading...");
    let mut chain = crate::store()
        .load_chain()
        .context("failed to load chain state")?;
    info!(height = chain.block_height(), "chain state loaded");
    chain.rebuild_utxos();

    let warm_start = crate::store().load_mempool();
    let now = Utc::now();
    let mut restored = 0;
    for tx in warm_start {
        if chain.submit_transaction(tx, now).is_ok() {
            restored += 1;
        }
    }
    if restored > 0 {
        info!(restored, "mempool warm start");
    }

    let mut service = crate::CHAIN.write().await;
    service.chain = chain;
    info!("initialization complete");
    Ok(())
}

/// Seal a payload with this node's identity.
pub fn seal(message: Message) -> Result<SignedMessage, NodeError> {
    SignedMessage::seal(message, crate::identity(), Utc::now())
}

pub async fn send_message(stream: &mut TcpStream, message: Message) -> Result<(), NodeError> {
    seal(message)?.send_async(stream).await
}

/// Receive one envelope from a stream and run the full verification path:
/// signature, clock skew, then the peer manager's rate/replay gate. Returns
/// None when the message must be dropped (the penalty is already applied).
pub async fn receive_verified(
    stream: &mut TcpStream,
    sender_hint: Option<&str>,
) -> Result<Option<VerifiedEnvelope>, NodeError> {
    let config = BlockchainConfig::global();
    let (envelope, recovered) =
        SignedMessage::receive_async(stream, config.peer.envelope_recovery).await?;
    if recovered {
        warn!("frame carried trailing junk after the envelope; recovered");
    }
    let now = Utc::now();
    let verified = match envelope.verify(now) {
        Ok(verified) => verified,
        Err(rejection) => {
            warn!(%rejection, "envelope rejected");
            if let Some(sender) = sender_hint {
                let offence = match rejection {
                    oxilib::error::EnvelopeRejection::StaleTimestamp => Misbehaviour::StaleTimestamp,
                    _ => Misbehaviour::BadSignature,
                };
                crate::PEER_TABLE.write().await.punish(sender, offence, now);
            }
            return Ok(None);
        }
    };

    let kind = verified.payload.kind();
    let admitted = crate::PEER_TABLE.write().await.admit_envelope(
        &verified.sender_id,
        &verified.nonce,
        kind,
        recovered,
        now,
    );
    if let Err(rejection) = admitted {
        debug!(sender = %verified.sender_id, %rejection, "envelope dropped by peer manager");
        return Ok(None);
    }
    Ok(Some(verified))
}

/// Send a request on the outbound session to `node_id` and wait for the
/// response envelope, with the configured deadline. The map guard serializes
/// access to the stream, so request/response pairs never interleave.
pub async fn request(node_id: &str, message: Message) -> Result<Message, NodeError> {
    let config = BlockchainConfig::global();
    let deadline = Duration::from_secs(config.node.request_timeout_secs);
    let mut stream = crate::NODES
        .get_mut(node_id)
        .ok_or_else(|| NodeError::network(format!("no session with {node_id}")))?;
    send_message(&mut stream, message).await?;
    let received = time::timeout(deadline, receive_verified(&mut stream, Some(node_id)))
        .await
        .map_err(|_| {
            NodeError::network(format!("request to {node_id} timed out"))
        })??;
    match received {
        Some(verified) => Ok(verified.payload),
        None => Err(NodeError::network("response failed verification")),
    }
}

/// Feed a block through the fork state machine and persist the outcome.
/// This is the only write path for blocks, shared by the peer handler, the
/// miner interface and catch-up sync.
pub async fn accept_block(block: Block, source: Option<&str>) -> Result<BlockDisposition, NodeError> {
    let hash = block.hash();
    let disposition = {
        let mut service = crate::CHAIN.write().await;
        let ChainService { chain, forks } = &mut *service;
        forks.process_block(chain, block.clone(), Utc::now())
    };

    let now = Utc::now();
    match &disposition {
        Ok(BlockDisposition::Extended { .. })
        | Ok(BlockDisposition::SideBranch { .. })
        | Ok(BlockDisposition::Reorganized { .. }) => {
            if let Err(e) = crate::store().append_block(&block) {
                warn!(error = %e, "failed to journal accepted block");
            }
            maybe_checkpoint().await;
            if let Some(source) = source {
                let mut peers = crate::PEER_TABLE.write().await;
                peers.reward(source, GoodBehaviour::FirstBlockRelay);
            }
        }
        Ok(BlockDisposition::Orphaned { .. }) | Ok(BlockDisposition::Duplicate) => {}
        Err(e) => {
            if let Some(source) = source {
                let offence = match e {
                    NodeError::ReorgTooDeep { .. } => Misbehaviour::OverdeepReorg,
                    _ => Misbehaviour::InvalidBlock,
                };
                crate::PEER_TABLE.write().await.punish(source, offence, now);
            }
            debug!(block = %hash, error = %e, "block rejected");
        }
    }
    disposition
}

async fn maybe_checkpoint() {
    let interval = BlockchainConfig::global().node.checkpoint_interval;
    let service = crate::CHAIN.read().await;
    if interval > 0 && service.chain.block_height() % interval == 0 {
        if let Err(e) = crate::store().write_checkpoint(&service.chain) {
            warn!(error = %e, "checkpoint write failed");
        }
    }
}

/// Broadcast an accepted block to every outbound session except the source,
/// once per peer per session, and consume the accept/reject acknowledgement.
pub async fn broadcast_block(block: &Block, except: Option<&str>) {
    let message = Message::Block(block.clone());
    let content = message.content_hash();
    let now = Utc::now();
    {
        let mut peers = crate::PEER_TABLE.write().await;
        if !peers.should_relay(MessageKind::Block, content, now) {
            return;
        }
    }

    let nodes: Vec<String> = crate::NODES.iter().map(|e| e.key().clone()).collect();
    for node_id in nodes {
        if Some(node_id.as_str()) == except {
            continue;
        }
        if !crate::PEER_TABLE.write().await.mark_sent(&node_id, content) {
            continue;
        }
        match request(&node_id, message.clone()).await {
            Ok(Message::BlockAck {
                accepted, reason, ..
            }) => {
                if !accepted {
                    debug!(peer = %node_id, ?reason, "peer rejected relayed block");
                }
            }
            Ok(_) => debug!(peer = %node_id, "unexpected response to block relay"),
            Err(e) => warn!(peer = %node_id, error = %e, "failed to relay block"),
        }
    }
}

/// Broadcast a newly admitted transaction; fire-and-forget.
pub async fn broadcast_transaction(tx: &oxilib::types::Transaction, except: Option<&str>) {
    let message = Message::Tx(tx.clone());
    let content = message.content_hash();
    let now = Utc::now();
    {
        let mut peers = crate::PEER_TABLE.write().await;
        if !peers.should_relay(MessageKind::Tx, content, now) {
            return;
        }
    }

    let nodes: Vec<String> = crate::NODES.iter().map(|e| e.key().clone()).collect();
    for node_id in nodes {
        if Some(node_id.as_str()) == except {
            continue;
        }
        if !crate::PEER_TABLE.write().await.mark_sent(&node_id, content) {
            continue;
        }
        if let Some(mut stream) = crate::NODES.get_mut(&node_id) {
            if let Err(e) = send_message(&mut stream, message.clone()).await {
                warn!(peer = %node_id, error = %e, "failed to relay transaction");
            }
        }
    }
}

// ---------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------

pub async fn cleanup_mempool() {
    let config = BlockchainConfig::global();
    let mut interval = time::interval(Duration::from_secs(
        config.node.mempool_cleanup_interval_secs,
    ));
    loop {
        interval.tick().await;
        let mut service = crate::CHAIN.write().await;
        let expired = service.chain.mempool_mut().expire(Utc::now());
        if !expired.is_empty() {
            info!(count = expired.len(), "expired old mempool transactions");
        }
    }
}

pub async fn save_chain_periodically() {
    let config = BlockchainConfig::global();
    let mut interval = time::interval(Duration::from_secs(config.node.chain_save_interval_secs));
    loop {
        interval.tick().await;
        let (chain, mempool_dump) = {
            let service = crate::CHAIN.read().await;
            let dump: Vec<_> = service
                .chain
                .mempool()
                .iter()
                .map(|entry| entry.transaction.clone())
                .collect();
            (service.chain.clone(), dump)
        };
        // Persistence failures never poison the in-memory state; keep
        // serving from RAM and alert the operator
        if let Err(e) = crate::store().save_chain(&chain) {
            tracing::error!(error = %e, "chain snapshot failed; continuing from memory");
        }
        if let Err(e) = crate::store().save_mempool(&mempool_dump) {
            warn!(error = %e, "mempool dump failed");
        }
    }
}

pub async fn prune_orphans() {
    let config = BlockchainConfig::global();
    let mut interval = time::interval(Duration::from_secs(config.node.orphan_prune_interval_secs));
    loop {
        interval.tick().await;
        let mut service = crate::CHAIN.write().await;
        let pruned = service.forks.prune_orphans(Utc::now());
        if pruned > 0 {
            debug!(pruned, "expired orphan blocks");
        }
    }
}

/// Periodic peer upkeep: expire replay caches, lift lapsed bans, and ping
/// every outbound session so dead connections are noticed and reaped.
pub async fn peer_maintenance() {
    let mut interval = time::interval(Duration::from_secs(30));
    let mut sequence: u64 = 0;
    loop {
        interval.tick().await;
        crate::PEER_TABLE.write().await.prune(Utc::now());

        sequence += 1;
        let nodes: Vec<String> = crate::NODES.iter().map(|e| e.key().clone()).collect();
        for node_id in nodes {
            match request(&node_id, Message::Ping(sequence)).await {
                Ok(Message::Pong(echo)) if echo == sequence => {}
                _ => {
                    warn!(peer = %node_id, "peer failed ping, dropping session");
                    crate::NODES.remove(&node_id);
                    crate::PEER_TABLE.write().await.disconnect(&node_id);
                }
            }
        }
    }
}
