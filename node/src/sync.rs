//! Outbound sessions and lineage catch-up.
//!
//! Catch-up is header-first: send a block locator, validate the returned
//! header range (linkage and proof of work), then pull the bodies in order
//! and feed them through the normal fork state machine. A peer that fails
//! to deliver inside the deadline is demoted and the work moves on to the
//! next peer.

use chrono::Utc;
use oxilib::config::BlockchainConfig;
use oxilib::consensus;
use oxilib::network::{Message, SignedMessage};
use oxilib::peer::{GoodBehaviour, Misbehaviour};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use crate::{handler, util};

static REQUEST_ID: AtomicU64 = AtomicU64::new(1);

fn next_request_id() -> u64 {
    REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

const HEADERS_PER_REQUEST: u32 = 500;

/// Dial the bootstrap peers, then widen through peer discovery until the
/// connection budget is spent.
pub async fn connect_to_peers(addresses: &[String]) {
    let max_peers = BlockchainConfig::global().node.max_peers;
    let mut queue: VecDeque<String> = addresses.iter().cloned().collect();
    let mut attempted: HashSet<String> = HashSet::new();

    while let Some(address) = queue.pop_front() {
        if crate::NODES.len() >= max_peers {
            break;
        }
        if !attempted.insert(address.clone()) {
            continue;
        }
        let Some(node_id) = connect_peer(&address).await else {
            continue;
        };
        // Ask the fresh peer who else is out there
        if let Ok(Message::NodeList(discovered)) =
            util::request(&node_id, Message::DiscoverNodes).await
        {
            debug!(peer = %node_id, count = discovered.len(), "received peer list");
            queue.extend(discovered);
        }
    }
}

/// Open an authenticated outbound session. Returns the peer's node id once
/// the Hello exchange has passed the compatibility checks.
pub async fn connect_peer(address: &str) -> Option<String> {
    let config = BlockchainConfig::global();
    if crate::NODES.len() >= config.node.max_peers {
        return None;
    }

    let deadline = Duration::from_secs(config.node.request_timeout_secs);
    let mut stream = match timeout(deadline, TcpStream::connect(address)).await {
        Ok(Ok(stream)) => stream,
        _ => {
            debug!(%address, "dial failed");
            return None;
        }
    };

    if let Err(e) =
        util::send_message(&mut stream, Message::Hello(handler::our_hello().await)).await
    {
        debug!(%address, error = %e, "failed to send handshake");
        return None;
    }
    let answer = timeout(
        deadline,
        SignedMessage::receive_async(&mut stream, config.peer.envelope_recovery),
    )
    .await;
    let envelope = match answer {
        Ok(Ok((envelope, _))) => envelope,
        _ => {
            debug!(%address, "no handshake answer");
            return None;
        }
    };
    let verified = match envelope.verify(Utc::now()) {
        Ok(verified) => verified,
        Err(rejection) => {
            warn!(%address, %rejection, "handshake envelope rejected");
            return None;
        }
    };
    let Message::Hello(info) = verified.payload else {
        warn!(%address, "peer answered handshake with something else");
        return None;
    };
    if info.node_id != verified.sender_id {
        warn!(%address, "hello node id does not match the signing key");
        return None;
    }

    let our_genesis = {
        let service = crate::CHAIN.read().await;
        let genesis = service.chain.main_chain().next().copied();
        genesis
    };
    {
        let mut peers = crate::PEER_TABLE.write().await;
        if let Err(refusal) = peers.validate_hello(&info, our_genesis, Utc::now()) {
            info!(%address, %refusal, "outbound handshake refused");
            return None;
        }
        peers.register(&info.node_id, address, Some(verified.sender), Utc::now());
        peers.mark_connected(&info.node_id);
    }

    if crate::NODES.contains_key(&info.node_id) {
        // Already have a session; keep the existing one
        return Some(info.node_id);
    }
    info!(peer = %info.node_id, %address, "outbound session established");
    crate::NODES.insert(info.node_id.clone(), stream);
    Some(info.node_id)
}

/// Bring the local chain up to the best advertised chain across all
/// sessions. Peers that cannot deliver get demoted and the next one is
/// tried.
pub async fn initial_sync() {
    let nodes: Vec<String> = crate::NODES.iter().map(|e| e.key().clone()).collect();
    for node_id in nodes {
        catch_up_with(&node_id).await;
    }
    let service = crate::CHAIN.read().await;
    info!(
        height = service.chain.block_height(),
        "initial sync complete"
    );
}

/// Lineage catch-up against one peer: locator out, headers back, validate,
/// then stream the bodies in order through normal validation.
pub async fn catch_up_with(node_id: &str) {
    loop {
        let locator = {
            let service = crate::CHAIN.read().await;
            service.chain.locator()
        };
        let request_id = next_request_id();
        let response = util::request(
            node_id,
            Message::GetHeaders {
                locator,
                max: HEADERS_PER_REQUEST,
                request_id,
            },
        )
        .await;

        let headers = match response {
            Ok(Message::Headers {
                headers,
                request_id: echoed,
            }) if echoed == request_id => headers,
            Ok(_) => {
                debug!(peer = %node_id, "mismatched headers response");
                return;
            }
            Err(e) => {
                debug!(peer = %node_id, error = %e, "headers request failed");
                crate::PEER_TABLE.write().await.punish(
                    node_id,
                    Misbehaviour::RequestTimeout,
                    Utc::now(),
                );
                return;
            }
        };
        if headers.is_empty() {
            return;
        }
        if let Err(e) = consensus::validate_header_chain(&headers) {
            warn!(peer = %node_id, error = %e, "peer served an invalid header range");
            crate::PEER_TABLE
                .write()
                .await
                .punish(node_id, Misbehaviour::InvalidBlock, Utc::now());
            return;
        }
        crate::PEER_TABLE
            .write()
            .await
            .reward(node_id, GoodBehaviour::UsefulHeaders);

        let batch = headers.len();
        for header in headers {
            let hash = header.hash();
            let known = {
                let service = crate::CHAIN.read().await;
                service.chain.contains_block(&hash)
            };
            if known {
                continue;
            }
            let response = util::request(
                node_id,
                Message::GetBlock {
                    hash,
                    request_id: next_request_id(),
                },
            )
            .await;
            match response {
                Ok(Message::Block(block)) if block.hash() == hash => {
                    if let Err(e) = util::accept_block(block, Some(node_id)).await {
                        debug!(peer = %node_id, error = %e, "synced block rejected");
                        return;
                    }
                }
                _ => {
                    debug!(peer = %node_id, "peer failed to deliver a promised body");
                    crate::PEER_TABLE.write().await.punish(
                        node_id,
                        Misbehaviour::RequestTimeout,
                        Utc::now(),
                    );
                    return;
                }
            }
        }
        if (batch as u32) < HEADERS_PER_REQUEST {
            return;
        }
    }
}
