use chrono::Utc;
use oxilib::config::BlockchainConfig;
use oxilib::fork::BlockDisposition;
use oxilib::network::{HelloInfo, Message, SignedMessage};
use oxilib::peer::Misbehaviour;
use oxilib::sha256::Hash;
use oxilib::types::{Block, BlockHeader, Transaction};
use oxilib::util::MerkleRoot;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::util;

/// Build our side of the handshake from the current chain state.
pub async fn our_hello() -> HelloInfo {
    let config = BlockchainConfig::global();
    let service = crate::CHAIN.read().await;
    let info = HelloInfo {
        node_id: crate::identity().public_key().fingerprint(),
        listen_port: config.node.port,
        protocol_version: config.peer.protocol_version,
        network_id: config.network.network_id.clone(),
        genesis: service.chain.main_chain().next().copied(),
        tip_height: service.chain.block_height(),
        tip_hash: service.chain.tip_hash(),
        best_work: service.chain.chain_work(),
    };
    info
}

pub async fn handle_connection(mut socket: TcpStream, remote: String) {
    let config = BlockchainConfig::global();

    // The first envelope must be the peer's identity
    let hello = match SignedMessage::receive_async(&mut socket, config.peer.envelope_recovery).await
    {
        Ok((envelope, _)) => match envelope.verify(Utc::now()) {
            Ok(verified) => match verified.payload {
                Message::Hello(info) if info.node_id == verified.sender_id => {
                    (info, verified.sender)
                }
                Message::Hello(_) => {
                    warn!(%remote, "hello node id does not match the signing key");
                    return;
                }
                _ => {
                    warn!(%remote, "peer spoke before introducing itself");
                    return;
                }
            },
            Err(rejection) => {
                warn!(%remote, %rejection, "handshake envelope rejected");
                return;
            }
        },
        Err(e) => {
            warn!(%remote, error = %e, "failed to read handshake");
            return;
        }
    };
    let (info, sender_key) = hello;
    let node_id = info.node_id.clone();

    // Refuse incompatible or banned peers before answering; a banned peer
    // never sees our identity
    let our_genesis = {
        let service = crate::CHAIN.read().await;
        let genesis = service.chain.main_chain().next().copied();
        genesis
    };
    {
        let mut peers = crate::PEER_TABLE.write().await;
        if let Err(refusal) = peers.validate_hello(&info, our_genesis, Utc::now()) {
            info!(peer = %node_id, %refusal, "handshake refused");
            return;
        }
        peers.register(&node_id, &remote, Some(sender_key), Utc::now());
    }

    if let Err(e) = util::send_message(&mut socket, Message::Hello(our_hello().await)).await {
        warn!(peer = %node_id, error = %e, "failed to answer handshake");
        return;
    }
    crate::PEER_TABLE.write().await.mark_connected(&node_id);
    info!(peer = %node_id, %remote, "peer connected");

    // Gossip flows over outbound sessions; make sure one exists for this
    // peer, and pull their chain if they advertise more work
    if !crate::NODES.contains_key(&node_id) {
        let dial_back = dial_back_address(&remote, info.listen_port);
        tokio::spawn(async move {
            crate::sync::connect_peer(&dial_back).await;
        });
    }
    let our_work = {
        let service = crate::CHAIN.read().await;
        service.chain.chain_work()
    };
    if info.best_work > our_work {
        let ahead = node_id.clone();
        tokio::spawn(async move {
            crate::sync::catch_up_with(&ahead).await;
        });
    }

    loop {
        let verified = match util::receive_verified(&mut socket, Some(&node_id)).await {
            Ok(Some(verified)) => verified,
            // Dropped by the verification/rate gate; keep the session
            Ok(None) => continue,
            Err(e) => {
                debug!(peer = %node_id, error = %e, "session ended");
                crate::PEER_TABLE.write().await.disconnect(&node_id);
                return;
            }
        };
        if verified.sender_id != node_id {
            warn!(peer = %node_id, "envelope signed by a different identity, closing");
            crate::PEER_TABLE.write().await.disconnect(&node_id);
            return;
        }
        dispatch(verified.payload, &node_id, &mut socket).await;
    }
}

fn dial_back_address(remote: &str, listen_port: u16) -> String {
    let host = remote.rsplit_once(':').map(|(host, _)| host).unwrap_or(remote);
    format!("{host}:{listen_port}")
}

async fn dispatch(message: Message, node_id: &str, socket: &mut TcpStream) {
    match message {
        // Responses and client-only messages have no business arriving
        // unsolicited on an inbound session
        Message::Headers { .. }
        | Message::BlockAck { .. }
        | Message::Template(_)
        | Message::TemplateValidity(_)
        | Message::Utxos(_)
        | Message::NodeList(_) => {
            debug!(peer = %node_id, "unsolicited response message ignored");
        }
        Message::Hello(_) => {
            // Identity was already exchanged; treat as a keep-alive
        }
        Message::Ping(sequence) => {
            let _ = util::send_message(socket, Message::Pong(sequence)).await;
        }
        Message::Pong(_) => {}
        Message::DiscoverNodes => {
            let peers = crate::PEER_TABLE.read().await;
            let nodes: Vec<String> = peers
                .connected()
                .map(|peer| peer.address.clone())
                .collect();
            let _ = util::send_message(socket, Message::NodeList(nodes)).await;
        }
        Message::Tx(tx) => {
            debug!(peer = %node_id, "received transaction");
            let result = {
                let mut service = crate::CHAIN.write().await;
                service.chain.submit_transaction(tx.clone(), Utc::now())
            };
            match result {
                Ok(_) => util::broadcast_transaction(&tx, Some(node_id)).await,
                Err(rejection) => {
                    debug!(peer = %node_id, %rejection, "transaction rejected");
                    if matches!(
                        rejection,
                        oxilib::error::MempoolRejection::Malformed
                            | oxilib::error::MempoolRejection::BadSignature
                    ) {
                        crate::PEER_TABLE.write().await.punish(
                            node_id,
                            Misbehaviour::InvalidTransaction,
                            Utc::now(),
                        );
                    }
                }
            }
        }
        Message::Block(block) => {
            info!(peer = %node_id, height = block.header.height, "received block");
            let hash = block.hash();
            let disposition = util::accept_block(block.clone(), Some(node_id)).await;
            let (accepted, reason) = match &disposition {
                Ok(BlockDisposition::Extended { .. })
                | Ok(BlockDisposition::Reorganized { .. })
                | Ok(BlockDisposition::SideBranch { .. })
                | Ok(BlockDisposition::Duplicate) => (true, None),
                Ok(BlockDisposition::Orphaned { .. }) => {
                    (false, Some("unknown parent".to_string()))
                }
                Err(e) => (false, Some(e.to_string())),
            };
            let _ = util::send_message(
                socket,
                Message::BlockAck {
                    hash,
                    accepted,
                    reason,
                },
            )
            .await;
            match disposition {
                Ok(BlockDisposition::Extended { .. }) | Ok(BlockDisposition::Reorganized { .. }) => {
                    util::broadcast_block(&block, Some(node_id)).await;
                }
                Ok(BlockDisposition::Orphaned { .. }) => {
                    // Ancestor request: pull the missing lineage from the
                    // peer that relayed the block
                    let from = node_id.to_string();
                    tokio::spawn(async move {
                        crate::sync::catch_up_with(&from).await;
                    });
                }
                _ => {}
            }
        }
        Message::GetHeaders {
            locator,
            max,
            request_id,
        } => {
            let headers = {
                let service = crate::CHAIN.read().await;
                service
                    .chain
                    .headers_after(&locator, (max as usize).min(2000))
            };
            let _ = util::send_message(
                socket,
                Message::Headers {
                    headers,
                    request_id,
                },
            )
            .await;
        }
        Message::GetBlock {
            hash,
            request_id: _,
        } => {
            let block = {
                let service = crate::CHAIN.read().await;
                service.chain.get_block(&hash).map(|stored| stored.block.clone())
            };
            let response = match block {
                Some(block) => Message::Block(block),
                None => Message::BlockAck {
                    hash,
                    accepted: false,
                    reason: Some("unknown block".to_string()),
                },
            };
            let _ = util::send_message(socket, response).await;
        }
        Message::FetchTemplate(pubkey) => {
            let template = build_template(pubkey).await;
            let _ = util::send_message(socket, Message::Template(template)).await;
        }
        Message::ValidateTemplate(template) => {
            let status = {
                let service = crate::CHAIN.read().await;
                template.header.prev_block_hash
                    == service.chain.tip_hash().unwrap_or_else(Hash::zero)
            };
            let _ = util::send_message(socket, Message::TemplateValidity(status)).await;
        }
        Message::SubmitTemplate(block) => {
            info!("received allegedly mined template");
            match util::accept_block(block.clone(), None).await {
                Ok(BlockDisposition::Extended { .. })
                | Ok(BlockDisposition::Reorganized { .. }) => {
                    info!(height = block.header.height, "mined block accepted, broadcasting");
                    util::broadcast_block(&block, None).await;
                }
                other => {
                    warn!(?other, "mined template not accepted");
                }
            }
        }
        Message::FetchUtxos(pubkey) => {
            debug!("received request to fetch UTXOs");
            let utxos = {
                let service = crate::CHAIN.read().await;
                service
                    .chain
                    .utxos()
                    .iter()
                    .filter(|(_, entry)| entry.output.pubkey == pubkey)
                    .map(|(outpoint, entry)| {
                        let reserved = service.chain.mempool().is_reserved(outpoint);
                        (*outpoint, entry.output.clone(), reserved)
                    })
                    .collect::<Vec<_>>()
            };
            let _ = util::send_message(socket, Message::Utxos(utxos)).await;
        }
    }
}

/// Assemble a candidate block for a miner: highest fee-rate transactions in
/// dependency order, coinbase paying the reward plus the fees.
async fn build_template(pubkey: oxilib::crypto::PublicKey) -> Block {
    let config = BlockchainConfig::global();
    let (mempool_txs, prev_block_hash, target, height, reward) = {
        let service = crate::CHAIN.read().await;
        let txs = service
            .chain
            .mempool()
            .take_for_block(config.network.block_transaction_cap - 1);
        (
            txs,
            service.chain.tip_hash().unwrap_or_else(Hash::zero),
            service.chain.target(),
            service.chain.block_height(),
            service.chain.calculate_block_reward(),
        )
    };

    let fees: u64 = mempool_txs.iter().map(|tx| tx.fee).sum();
    let mut transactions = vec![Transaction::coinbase(oxilib::types::TransactionOutput {
        value: reward + fees,
        pubkey,
    })];
    transactions.extend(mempool_txs);

    let merkle_root = MerkleRoot::calculate(&transactions);
    Block::new(
        BlockHeader {
            timestamp: Utc::now(),
            nonce: 0,
            prev_block_hash,
            merkle_root,
            target,
            height,
        },
        transactions,
    )
}
