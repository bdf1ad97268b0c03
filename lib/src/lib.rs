//! # Oxilib - Oxicoin Core Library
//!
//! Core of the oxicoin proof-of-work node: block and transaction types, the
//! UTXO ledger, consensus and difficulty rules, the fork manager, mempool,
//! persistence and the signed peer-to-peer message protocol.
//!
//! The binaries in this workspace (`node`, `miner`) are thin drivers around
//! this library; everything that decides chain consistency lives here.

use serde::{Deserialize, Serialize};
use uint::construct_uint;
construct_uint! {
    // Construct an unsigned 256-bit integer
    // consisting of 4 x 64-bit words
    #[derive(Deserialize, Serialize)]
    pub struct U256(4);
}
// =============================================================================
// CONSENSUS PARAMETERS - Default Values
// =============================================================================
// Deployment defaults for the consensus rules. The config module reads them
// when no environment override is provided; a node rejects blocks that
// disagree with its configured set.
// =============================================================================

/// Initial block reward in whole coins - multiply by 10^8 to get base units
pub const INITIAL_REWARD: u64 = 50;

/// Halving interval in blocks
pub const HALVING_INTERVAL: u64 = 210;

/// Hard supply cap in base units. Equals the exact sum of the halving
/// schedule, so the final scheduled coinbase drains the remainder precisely.
pub const MAX_SUPPLY: u64 = 2_100_000_000_000;

/// Ideal block time in seconds
pub const IDEAL_BLOCK_TIME: u64 = 10;

/// Minimum target (easiest difficulty)
pub const MIN_TARGET: U256 = U256([
    0xFFFF_FFFF_FFFF_FFFF,
    0xFFFF_FFFF_FFFF_FFFF,
    0xFFFF_FFFF_FFFF_FFFF,
    0x0000_FFFF_FFFF_FFFF,
]);

/// Difficulty update interval in blocks
pub const DIFFICULTY_UPDATE_INTERVAL: u64 = 50;

/// Largest single retarget step, as a factor up or down
pub const MAX_RETARGET_FACTOR: u64 = 4;

/// Number of ancestors over which the median-past timestamp is taken
pub const MEDIAN_TIME_WINDOW: usize = 11;

/// How far in the future a block timestamp may lie, in seconds
pub const MAX_FUTURE_DRIFT: i64 = 7200;

/// Deepest reorganization the node will execute without operator action
pub const MAX_REORG_DEPTH: u64 = 100;

/// Minimum fee for a non-coinbase transaction, in base units
pub const MIN_TRANSACTION_FEE: u64 = 1000;

/// Maximum serialized transaction size in bytes
pub const MAX_TRANSACTION_SIZE: usize = 100_000;

/// Maximum serialized block size in bytes
pub const MAX_BLOCK_SIZE: usize = 1_000_000;

/// Maximum amount of transactions allowed in a block
pub const BLOCK_TRANSACTION_CAP: usize = 20;

/// Maximum mempool transaction age in seconds
pub const MAX_MEMPOOL_TRANSACTION_AGE: u64 = 600;

pub mod builder;
pub mod config;
pub mod consensus;
pub mod crypto;
pub mod error;
pub mod fork;
pub mod mempool;
pub mod network;
pub mod peer;
pub mod persistence;
pub mod sha256;
pub mod util;

#[cfg(test)]
pub mod test_helpers;

#[path = "../types/mod.rs"]
pub mod types;
