//! Integration tests for the chain core: full workflows over in-memory
//! state, no network or disk involved.
//!
//! Covered scenarios:
//! 1. Genesis-only boot
//! 2. Single transaction round-trip
//! 3. Double-spend attempt at the mempool
//! 4. Two-block reorganization with transaction resurrection
//! 5. Orphan chain arrival and collapse
//! 6. Envelope tampering
//!
//! The supply-cap boundary scenario lives in `tests/supply_cap.rs` because
//! it needs its own consensus parameters.

use chrono::{Duration, Utc};
use oxilib::builder::{self, OwnedKey};
use oxilib::config;
use oxilib::crypto::{PrivateKey, PublicKey};
use oxilib::error::MempoolRejection;
use oxilib::fork::{BlockDisposition, ForkManager};
use oxilib::network::{Message, SignedMessage};
use oxilib::peer::{Misbehaviour, PeerManager};
use oxilib::sha256::Hash;
use oxilib::types::{Block, BlockHeader, ChainState, Transaction, TransactionOutput};
use oxilib::util::MerkleRoot;

fn create_test_output(value: u64, key: &PrivateKey) -> TransactionOutput {
    TransactionOutput {
        value,
        pubkey: key.public_key(),
    }
}

fn mine(block: &mut Block) {
    while !block.header.hash().matches_target(block.header.target) {
        block.header.nonce += 1;
    }
}

fn next_block(
    chain: &ChainState,
    transactions: Vec<Transaction>,
    miner_key: &PrivateKey,
) -> Block {
    let fees: u64 = transactions.iter().map(|tx| tx.fee).sum();
    let reward = chain.calculate_block_reward();
    let coinbase = Transaction::coinbase(create_test_output(reward + fees, miner_key));

    let mut all = vec![coinbase];
    all.extend(transactions);
    let timestamp = match chain.tip() {
        Some(tip) => tip.block.header.timestamp + Duration::seconds(1),
        None => Utc::now(),
    };
    let header = BlockHeader::new(
        timestamp,
        0,
        chain.tip_hash().unwrap_or_else(Hash::zero),
        MerkleRoot::calculate(&all),
        chain.target(),
        chain.block_height(),
    );
    let mut block = Block::new(header, all);
    mine(&mut block);
    block
}

fn chain_with_genesis() -> (ChainState, PrivateKey) {
    let mut chain = ChainState::new();
    let miner_key = PrivateKey::new_key();
    let genesis = next_block(&chain, vec![], &miner_key);
    chain
        .connect_block(genesis, Utc::now())
        .expect("genesis must connect");
    (chain, miner_key)
}

fn transfer(
    chain: &ChainState,
    from: &PrivateKey,
    to: &PublicKey,
    amount: u64,
    fee: u64,
) -> Transaction {
    builder::build_payment(
        &[OwnedKey::from_private(from.clone())],
        chain.utxos(),
        chain.mempool(),
        to,
        amount,
        fee,
    )
    .expect("transfer must be buildable")
}

fn balance_of(chain: &ChainState, key: &PublicKey) -> u64 {
    chain
        .utxos()
        .values()
        .filter(|entry| entry.output.pubkey == *key)
        .map(|entry| entry.output.value)
        .sum()
}

/// Invariants that must hold after every accepted operation: supply within
/// the cap and consistent with the UTXO set, and an intact main chain.
fn assert_invariants(chain: &ChainState) {
    let utxo_sum: u64 = chain.utxos().values().map(|e| e.output.value).sum();
    assert_eq!(chain.circulating_supply(), utxo_sum);
    assert!(chain.circulating_supply() <= config::max_supply());

    let mut prev: Option<Hash> = None;
    for (height, hash) in chain.main_chain().enumerate() {
        let stored = chain.get_block(hash).unwrap();
        assert_eq!(stored.block.header.height, height as u64);
        assert!(stored
            .block
            .header
            .hash()
            .matches_target(stored.block.header.target));
        match prev {
            None => assert_eq!(stored.block.header.prev_block_hash, Hash::zero()),
            Some(parent) => assert_eq!(stored.block.header.prev_block_hash, parent),
        }
        prev = Some(*hash);
    }
}

#[test]
fn test_genesis_only_boot() {
    let (chain, miner_key) = chain_with_genesis();

    assert_eq!(chain.block_height(), 1);
    let genesis = chain.block_at_height(0).unwrap();
    assert_eq!(genesis.block.header.height, 0);
    assert_eq!(genesis.block.header.prev_block_hash, Hash::zero());

    // Supply equals the genesis allocation, all of it owned by the miner
    let allocation = config::initial_reward() * 100_000_000;
    assert_eq!(chain.circulating_supply(), allocation);
    assert_eq!(balance_of(&chain, &miner_key.public_key()), allocation);
    assert!(chain.mempool().is_empty());
    assert_invariants(&chain);
}

#[test]
fn test_single_transaction_round_trip() {
    let (mut chain, wallet_a) = chain_with_genesis();
    let wallet_b = PrivateKey::new_key();
    let miner = PrivateKey::new_key();

    let funded = balance_of(&chain, &wallet_a.public_key());
    let amount = 10_000;
    let fee = 2000;

    let tx = transfer(&chain, &wallet_a, &wallet_b.public_key(), amount, fee);
    chain.submit_transaction(tx.clone(), Utc::now()).unwrap();

    let block = next_block(&chain, chain.mempool().take_for_block(20), &miner);
    chain.connect_block(block, Utc::now()).unwrap();

    assert_eq!(balance_of(&chain, &wallet_a.public_key()), funded - amount - fee);
    assert_eq!(balance_of(&chain, &wallet_b.public_key()), amount);
    assert_eq!(
        balance_of(&chain, &miner.public_key()),
        oxilib::consensus::block_subsidy(1) + fee
    );
    assert!(chain.mempool().is_empty());
    assert_invariants(&chain);
}

#[test]
fn test_double_spend_attempt() {
    let (mut chain, wallet_a) = chain_with_genesis();
    let wallet_b = PrivateKey::new_key();
    let wallet_c = PrivateKey::new_key();
    let miner = PrivateKey::new_key();

    // Both spend the same genesis output with the same fee
    let tx1 = transfer(&chain, &wallet_a, &wallet_b.public_key(), 10_000, 2000);
    let tx2 = transfer(&chain, &wallet_a, &wallet_c.public_key(), 11_000, 2000);

    assert!(chain.submit_transaction(tx1.clone(), Utc::now()).is_ok());
    assert_eq!(
        chain.submit_transaction(tx2, Utc::now()),
        Err(MempoolRejection::Conflict)
    );
    assert_eq!(chain.mempool().len(), 1);

    let block = next_block(&chain, chain.mempool().take_for_block(20), &miner);
    chain.connect_block(block, Utc::now()).unwrap();

    assert_eq!(balance_of(&chain, &wallet_b.public_key()), 10_000);
    assert_eq!(balance_of(&chain, &wallet_c.public_key()), 0);
    assert_invariants(&chain);
}

#[test]
fn test_two_block_reorganization() {
    let (mut node_x, miner_x) = chain_with_genesis();
    let mut node_y = node_x.clone();
    let miner_y = PrivateKey::new_key();
    let recipient = PrivateKey::new_key();

    // X mines two blocks, the first carrying a payment
    let tx = transfer(&node_x, &miner_x, &recipient.public_key(), 10_000, 2000);
    let a1 = next_block(&node_x, vec![tx.clone()], &miner_x);
    node_x.connect_block(a1, Utc::now()).unwrap();
    let a2 = next_block(&node_x, vec![], &miner_x);
    node_x.connect_block(a2, Utc::now()).unwrap();

    // Y mines three blocks on the shared genesis
    let mut y_blocks = vec![];
    for _ in 0..3 {
        let block = next_block(&node_y, vec![], &miner_y);
        node_y.connect_block(block.clone(), Utc::now()).unwrap();
        y_blocks.push(block);
    }

    // X learns Y's chain; the third block tips the work balance
    let mut forks = ForkManager::new();
    let mut last = BlockDisposition::Duplicate;
    for block in y_blocks {
        last = forks
            .process_block(&mut node_x, block, Utc::now())
            .unwrap();
    }
    assert!(matches!(
        last,
        BlockDisposition::Reorganized {
            disconnected: 2,
            connected: 3,
            ..
        }
    ));

    // Post-state only: Y's chain won, the displaced payment is pending again
    assert_eq!(node_x.tip_hash(), node_y.tip_hash());
    assert_eq!(balance_of(&node_x, &recipient.public_key()), 0);
    assert!(node_x.mempool().contains(&tx.hash()));
    assert_invariants(&node_x);
}

#[test]
fn test_orphan_chain_arrival() {
    let (mut chain, miner) = chain_with_genesis();
    let mut donor = chain.clone();

    let mut blocks = vec![];
    for _ in 0..3 {
        let block = next_block(&donor, vec![], &miner);
        donor.connect_block(block.clone(), Utc::now()).unwrap();
        blocks.push(block);
    }

    // The newest block arrives first: it must wait for its lineage
    let mut forks = ForkManager::new();
    let disposition = forks
        .process_block(&mut chain, blocks[2].clone(), Utc::now())
        .unwrap();
    assert_eq!(
        disposition,
        BlockDisposition::Orphaned {
            missing_parent: blocks[1].hash()
        }
    );
    assert_eq!(chain.block_height(), 1);

    // Middle block arrives: still an orphan chain, one deeper
    let disposition = forks
        .process_block(&mut chain, blocks[1].clone(), Utc::now())
        .unwrap();
    assert_eq!(
        disposition,
        BlockDisposition::Orphaned {
            missing_parent: blocks[0].hash()
        }
    );

    // The missing ancestor arrives and the whole chain collapses in order
    let disposition = forks
        .process_block(&mut chain, blocks[0].clone(), Utc::now())
        .unwrap();
    assert!(matches!(disposition, BlockDisposition::Extended { .. }));
    assert_eq!(chain.block_height(), 4);
    assert_eq!(chain.tip_hash(), Some(blocks[2].hash()));
    assert_eq!(forks.orphan_count(), 0);
    assert_invariants(&chain);
}

#[test]
fn test_envelope_tampering_decrements_reputation() {
    let (chain, _) = chain_with_genesis();
    let peer_key = PrivateKey::new_key();
    let peer_id = peer_key.public_key().fingerprint();
    let now = Utc::now();

    let mut peers = PeerManager::new(now);
    peers.register(&peer_id, "127.0.0.1:9001", Some(peer_key.public_key()), now);

    let mut envelope =
        SignedMessage::seal(Message::Ping(1), &peer_key, now).unwrap();
    // Flip one byte of the nonce
    let mut nonce = envelope.message.nonce.into_bytes();
    nonce[0] = if nonce[0] == b'f' { b'e' } else { b'f' };
    envelope.message.nonce = String::from_utf8(nonce).unwrap();

    let rejection = envelope.verify(now).map(|_| ()).unwrap_err();
    peers.punish(&peer_id, Misbehaviour::BadSignature, now);

    assert_eq!(rejection, oxilib::error::EnvelopeRejection::BadSignature);
    assert!(peers.get(&peer_id).unwrap().reputation < 0);
    // Chain state is untouched by the dropped message
    assert_eq!(chain.block_height(), 1);
    assert!(chain.mempool().is_empty());
}

#[test]
fn test_randomized_fork_topologies_keep_invariants() {
    let (mut chain, miner) = chain_with_genesis();
    let mut forks = ForkManager::new();

    // Grow a handful of competing branches from random fork points and feed
    // every block in; whatever wins, the invariants must hold
    let mut branch_tips: Vec<ChainState> = vec![chain.clone()];
    for seed in 0u64..6 {
        let fork_from = (seed as usize * 7) % branch_tips.len();
        let mut branch = branch_tips[fork_from].clone();
        let branch_miner = PrivateKey::new_key();
        let depth = 1 + (seed % 3);
        let mut grown = vec![];
        for _ in 0..depth {
            let block = next_block(&branch, vec![], &branch_miner);
            branch.connect_block(block.clone(), Utc::now()).unwrap();
            grown.push(block);
        }
        branch_tips.push(branch);
        for block in grown {
            let _ = forks.process_block(&mut chain, block, Utc::now());
        }
        assert_invariants(&chain);
    }

    // The local tip carries at least as much work as every branch we fed in
    let best_branch_work = branch_tips
        .iter()
        .map(|branch| branch.chain_work())
        .max()
        .unwrap();
    assert!(chain.chain_work() >= best_branch_work);
    let _ = miner;
}
