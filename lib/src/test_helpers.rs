//! Shared test helper functions for unit and integration tests.

use crate::builder::{self, OwnedKey};
use crate::crypto::{PrivateKey, PublicKey};
use crate::sha256::Hash;
use crate::types::{Block, BlockHeader, ChainState, Transaction, TransactionOutput};
use crate::util::MerkleRoot;
use chrono::{DateTime, Duration, Utc};

/// Create a test transaction output paying the given key.
pub fn create_test_output(value: u64, private_key: &PrivateKey) -> TransactionOutput {
    TransactionOutput {
        value,
        pubkey: private_key.public_key(),
    }
}

/// Grind the nonce until the header hash meets its target.
pub fn mine(block: &mut Block) {
    while !block.header.hash().matches_target(block.header.target) {
        block.header.nonce += 1;
    }
}

/// A timestamp that satisfies the median-past rule on top of the current
/// tip: one second past the tip's own timestamp, or now for genesis.
pub fn next_timestamp(chain: &ChainState) -> DateTime<Utc> {
    match chain.tip() {
        Some(tip) => tip.block.header.timestamp + Duration::seconds(1),
        None => Utc::now(),
    }
}

/// Assemble and mine a block extending the current tip: coinbase paying
/// reward plus fees to `miner_key`, then the given transactions.
pub fn next_block(
    chain: &ChainState,
    transactions: Vec<Transaction>,
    miner_key: &PrivateKey,
    timestamp: DateTime<Utc>,
) -> Block {
    let fees: u64 = transactions.iter().map(|tx| tx.fee).sum();
    let reward = chain.calculate_block_reward();
    let coinbase = Transaction::coinbase(create_test_output(reward + fees, miner_key));

    let mut all = vec![coinbase];
    all.extend(transactions);
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

/// A fresh chain holding only a mined genesis block; the returned key owns
/// the genesis coinbase.
pub fn chain_with_genesis() -> (ChainState, PrivateKey) {
    let mut chain = ChainState::new();
    let miner_key = PrivateKey::new_key();
    let genesis = next_block(&chain, vec![], &miner_key, Utc::now());
    chain
        .connect_block(genesis, Utc::now())
        .expect("genesis must connect");
    (chain, miner_key)
}

/// Build a signed payment from `from`'s confirmed outputs.
pub fn transfer(
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

/// Sum of confirmed outputs paying the given key.
pub fn balance_of(chain: &ChainState, key: &PublicKey) -> u64 {
    chain
        .utxos()
        .values()
        .filter(|entry| entry.output.pubkey == *key)
        .map(|entry| entry.output.value)
        .sum()
}
