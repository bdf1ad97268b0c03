use crate::crypto::PrivateKey;
use crate::fork::{BlockDisposition, ForkManager};
use crate::sha256::Hash;
use crate::test_helpers::{
    balance_of, chain_with_genesis, next_block, next_timestamp, transfer,
};
use crate::types::{Block, ChainState};
use chrono::Utc;

fn extend(chain: &mut ChainState, miner: &PrivateKey) -> Block {
    let timestamp = next_timestamp(chain);
    let block = next_block(chain, vec![], miner, timestamp);
    chain.connect_block(block.clone(), Utc::now()).unwrap();
    block
}

#[test]
fn test_block_extending_tip() {
    let (mut chain, miner) = chain_with_genesis();
    let mut forks = ForkManager::new();

    let timestamp = next_timestamp(&chain);
    let block = next_block(&chain, vec![], &miner, timestamp);
    let hash = block.hash();

    let disposition = forks.process_block(&mut chain, block, Utc::now()).unwrap();
    assert_eq!(disposition, BlockDisposition::Extended { new_tip: hash });
    assert_eq!(chain.block_height(), 2);
}

#[test]
fn test_duplicate_block_is_reported() {
    let (mut chain, miner) = chain_with_genesis();
    let mut forks = ForkManager::new();

    let timestamp = next_timestamp(&chain);
    let block = next_block(&chain, vec![], &miner, timestamp);
    forks
        .process_block(&mut chain, block.clone(), Utc::now())
        .unwrap();

    let disposition = forks.process_block(&mut chain, block, Utc::now()).unwrap();
    assert_eq!(disposition, BlockDisposition::Duplicate);
}

#[test]
fn test_orphan_waits_for_parent_then_collapses() {
    let (mut chain, miner) = chain_with_genesis();
    // Build two more blocks on a private copy, then deliver out of order
    let mut donor = chain.clone();
    let block1 = extend(&mut donor, &miner);
    let block2 = extend(&mut donor, &miner);

    let mut forks = ForkManager::new();
    let disposition = forks
        .process_block(&mut chain, block2.clone(), Utc::now())
        .unwrap();
    assert_eq!(
        disposition,
        BlockDisposition::Orphaned {
            missing_parent: block1.hash()
        }
    );
    assert_eq!(forks.orphan_count(), 1);
    assert_eq!(chain.block_height(), 1);

    // The missing parent arrives; the orphan chain collapses onto the tip
    let disposition = forks.process_block(&mut chain, block1, Utc::now()).unwrap();
    assert!(matches!(disposition, BlockDisposition::Extended { .. }));
    assert_eq!(chain.block_height(), 3);
    assert_eq!(chain.tip_hash(), Some(block2.hash()));
    assert_eq!(forks.orphan_count(), 0);
}

#[test]
fn test_equal_work_branch_does_not_switch() {
    let (mut chain_x, miner_x) = chain_with_genesis();
    let mut chain_y = chain_x.clone();
    let miner_y = PrivateKey::new_key();

    extend(&mut chain_x, &miner_x);
    extend(&mut chain_x, &miner_x);
    let b1 = extend(&mut chain_y, &miner_y);
    let b2 = extend(&mut chain_y, &miner_y);

    let tip_before = chain_x.tip_hash();
    let mut forks = ForkManager::new();
    let disposition = forks.process_block(&mut chain_x, b1, Utc::now()).unwrap();
    assert!(matches!(disposition, BlockDisposition::SideBranch { .. }));
    let disposition = forks.process_block(&mut chain_x, b2, Utc::now()).unwrap();
    // Same cumulative work as the main chain: hysteresis keeps the tip
    assert!(matches!(disposition, BlockDisposition::SideBranch { .. }));
    assert_eq!(chain_x.tip_hash(), tip_before);
}

#[test]
fn test_heavier_branch_triggers_reorganization() {
    let (mut chain_x, miner_x) = chain_with_genesis();
    let mut chain_y = chain_x.clone();
    let miner_y = PrivateKey::new_key();
    let recipient = PrivateKey::new_key();

    // X mines two blocks, the first carrying a payment
    let tx = transfer(&chain_x, &miner_x, &recipient.public_key(), 10_000, 2000);
    let timestamp = next_timestamp(&chain_x);
    let a1 = next_block(&chain_x, vec![tx.clone()], &miner_x, timestamp);
    chain_x.connect_block(a1, Utc::now()).unwrap();
    extend(&mut chain_x, &miner_x);
    assert_eq!(balance_of(&chain_x, &recipient.public_key()), 10_000);

    // Y mines three empty blocks on the shared genesis
    let b1 = extend(&mut chain_y, &miner_y);
    let b2 = extend(&mut chain_y, &miner_y);
    let b3 = extend(&mut chain_y, &miner_y);

    let mut forks = ForkManager::new();
    forks
        .process_block(&mut chain_x, b1, Utc::now())
        .unwrap();
    forks
        .process_block(&mut chain_x, b2, Utc::now())
        .unwrap();
    let disposition = forks
        .process_block(&mut chain_x, b3.clone(), Utc::now())
        .unwrap();

    assert_eq!(
        disposition,
        BlockDisposition::Reorganized {
            disconnected: 2,
            connected: 3,
            new_tip: b3.hash(),
        }
    );
    assert_eq!(chain_x.tip_hash(), Some(b3.hash()));
    assert_eq!(chain_x.block_height(), 4);
    // The displaced payment was returned to the mempool, not lost
    assert_eq!(balance_of(&chain_x, &recipient.public_key()), 0);
    assert!(chain_x.mempool().contains(&tx.hash()));
}

#[test]
fn test_reorganization_preserves_supply_accounting() {
    let (mut chain_x, miner_x) = chain_with_genesis();
    let mut chain_y = chain_x.clone();
    let miner_y = PrivateKey::new_key();

    extend(&mut chain_x, &miner_x);
    let b1 = extend(&mut chain_y, &miner_y);
    let b2 = extend(&mut chain_y, &miner_y);

    let mut forks = ForkManager::new();
    forks.process_block(&mut chain_x, b1, Utc::now()).unwrap();
    forks.process_block(&mut chain_x, b2, Utc::now()).unwrap();

    // Supply equals the subsidy schedule for three blocks regardless of
    // which branch won
    let expected: u64 = (0..3).map(crate::consensus::block_subsidy).sum();
    assert_eq!(chain_x.circulating_supply(), expected);
    let utxo_sum: u64 = chain_x.utxos().values().map(|e| e.output.value).sum();
    assert_eq!(utxo_sum, expected);
}

#[test]
fn test_orphan_pool_ttl_pruning() {
    let (mut chain, miner) = chain_with_genesis();
    let mut donor = chain.clone();
    extend(&mut donor, &miner);
    let block2 = extend(&mut donor, &miner);

    let mut forks = ForkManager::new();
    forks
        .process_block(&mut chain, block2, Utc::now())
        .unwrap();
    assert_eq!(forks.orphan_count(), 1);

    let ttl = crate::config::BlockchainConfig::global().node.orphan_ttl_secs as i64;
    assert_eq!(forks.prune_orphans(Utc::now() + chrono::Duration::seconds(ttl + 1)), 1);
    assert_eq!(forks.orphan_count(), 0);
    assert_eq!(forks.orphan_bytes(), 0);
}

#[test]
fn test_unknown_shape_invalid_block_is_rejected() {
    let (mut chain, miner) = chain_with_genesis();
    let mut forks = ForkManager::new();

    // Unknown parent and an unmined header: rejected, not pooled
    let timestamp = next_timestamp(&chain);
    let mut block = next_block(&chain, vec![], &miner, timestamp);
    block.header.prev_block_hash = Hash::hash(&"unknown parent");
    // Undo the mining so the PoW no longer holds
    block.header.nonce = u64::MAX;
    if block.header.hash().matches_target(block.header.target) {
        block.header.nonce -= 1;
    }
    let rejected = forks.process_block(&mut chain, block, Utc::now());
    assert!(rejected.is_err());
    assert_eq!(forks.orphan_count(), 0);
}
