//! Centralized configuration for every tunable in the node.
//!
//! Configuration priority (highest to lowest):
//! 1. Environment variables
//! 2. .env file
//! 3. Hardcoded defaults
//!
//! Consensus parameters live in [`NetworkConfig`]; a node validates blocks
//! against its own configured set and rejects blocks that disagree, so every
//! node of a deployment must run the same values.

use crate::util::Saveable;
use crate::U256;
use serde::{Deserialize, Serialize};
use std::io::{Error as IoError, ErrorKind as IoErrorKind, Read, Result as IoResult, Write};
use std::sync::OnceLock;

/// Global configuration instance
static CONFIG: OnceLock<BlockchainConfig> = OnceLock::new();

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BlockchainConfig {
    /// Consensus rules shared by the whole network
    pub network: NetworkConfig,

    /// Node-specific settings
    pub node: NodeConfig,

    /// Mempool policy
    pub mempool: MempoolConfig,

    /// Peer manager policy
    pub peer: PeerConfig,

    /// Mining parameters
    pub mining: MiningConfig,
}

/// Network consensus parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Network identifier (mainnet, testnet, devnet)
    pub network_id: String,

    /// Initial block reward in whole coins (multiplied by 10^8 for base units)
    pub initial_reward: u64,

    /// Number of blocks between reward halvings
    pub halving_interval: u64,

    /// Hard supply cap in base units
    pub max_supply: u64,

    /// Target time between blocks in seconds
    pub ideal_block_time: u64,

    /// Number of blocks between difficulty adjustments
    pub difficulty_update_interval: u64,

    /// Largest retarget step, as a factor up or down
    pub max_retarget_factor: u64,

    /// Ancestor window for the median-past timestamp rule
    pub median_time_window: usize,

    /// Maximum block timestamp drift into the future, seconds
    pub max_future_drift_secs: i64,

    /// Deepest reorganization executed without operator action
    pub max_reorg_depth: u64,

    /// Fee floor for non-coinbase transactions, base units
    pub min_transaction_fee: u64,

    /// Serialized size caps
    pub max_transaction_size: usize,
    pub max_block_size: usize,

    /// Maximum number of transactions per block
    pub block_transaction_cap: usize,

    /// Minimum difficulty target (easiest difficulty)
    /// Format: hex string like "0x0000FFFFFFFFFFFF..."
    pub min_target_hex: String,
}

/// Node operation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Port to listen on
    pub port: u16,

    /// Data directory; chain state, checkpoints, backups and keys live here
    pub data_dir: String,

    /// Initial peer addresses
    pub initial_peers: Vec<String>,

    /// Mempool cleanup interval in seconds
    pub mempool_cleanup_interval_secs: u64,

    /// Chain state save interval in seconds
    pub chain_save_interval_secs: u64,

    /// Orphan pool maintenance interval in seconds
    pub orphan_prune_interval_secs: u64,

    /// Blocks between UTXO checkpoints
    pub checkpoint_interval: u64,

    /// Snapshot backups kept on disk
    pub backup_rotation: usize,

    /// Orphan pool bounds
    pub orphan_pool_max_count: usize,
    pub orphan_pool_max_bytes: usize,
    pub orphan_ttl_secs: u64,

    /// Maximum number of peer connections
    pub max_peers: usize,

    /// Per-request network deadline in seconds
    pub request_timeout_secs: u64,
}

/// Mempool policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MempoolConfig {
    /// Entry-count cap
    pub max_count: usize,

    /// Total serialized-bytes cap
    pub max_bytes: usize,

    /// Maximum age of mempool transactions in seconds
    pub max_transaction_age: u64,

    /// Absolute fee a replacement must add over the displaced entry
    pub replacement_fee_bump: u64,
}

/// Peer manager policy: envelope checks, rate limits, reputation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Protocol version announced in the handshake
    pub protocol_version: u32,

    /// Envelope timestamps further than this from local time are rejected
    pub max_clock_skew_secs: i64,

    /// How long a (sender, nonce) pair is remembered for replay detection
    pub nonce_window_secs: i64,

    /// Accept envelopes with trailing junk after the first balanced object
    pub envelope_recovery: bool,

    /// Token bucket per peer per message kind
    pub bucket_capacity: f64,
    pub bucket_refill_per_sec: f64,

    /// Aggregate ingress bucket for the whole node
    pub ingress_capacity: f64,
    pub ingress_refill_per_sec: f64,

    /// Reputation thresholds; score starts at 0 and is clamped to the bound
    pub reputation_bound: i32,
    pub warn_threshold: i32,
    pub ban_threshold: i32,

    /// Cool-off before a banned peer may reconnect, seconds
    pub unban_after_secs: i64,
}

/// Mining configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiningConfig {
    /// Number of nonces to try in each mining batch
    pub mining_batch_size: usize,

    /// Seconds between template fetches/validations
    pub template_fetch_interval_secs: u64,

    /// Node address to connect to
    pub node_address: String,

    /// Public key file for receiving rewards
    pub public_key_file: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            network_id: "mainnet".to_string(),
            initial_reward: crate::INITIAL_REWARD,
            halving_interval: crate::HALVING_INTERVAL,
            max_supply: crate::MAX_SUPPLY,
            ideal_block_time: crate::IDEAL_BLOCK_TIME,
            difficulty_update_interval: crate::DIFFICULTY_UPDATE_INTERVAL,
            max_retarget_factor: crate::MAX_RETARGET_FACTOR,
            median_time_window: crate::MEDIAN_TIME_WINDOW,
            max_future_drift_secs: crate::MAX_FUTURE_DRIFT,
            max_reorg_depth: crate::MAX_REORG_DEPTH,
            min_transaction_fee: crate::MIN_TRANSACTION_FEE,
            max_transaction_size: crate::MAX_TRANSACTION_SIZE,
            max_block_size: crate::MAX_BLOCK_SIZE,
            block_transaction_cap: crate::BLOCK_TRANSACTION_CAP,
            min_target_hex:
                "0x0000FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF".to_string(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            port: 9000,
            data_dir: "./oxicoin-data".to_string(),
            initial_peers: vec![],
            mempool_cleanup_interval_secs: 30,
            chain_save_interval_secs: 15,
            orphan_prune_interval_secs: 30,
            checkpoint_interval: 1000,
            backup_rotation: 5,
            orphan_pool_max_count: 100,
            orphan_pool_max_bytes: 10_000_000,
            orphan_ttl_secs: 600,
            max_peers: 50,
            request_timeout_secs: 20,
        }
    }
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            max_count: 5000,
            max_bytes: 50_000_000,
            max_transaction_age: crate::MAX_MEMPOOL_TRANSACTION_AGE,
            replacement_fee_bump: 1000,
        }
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            protocol_version: 1,
            max_clock_skew_secs: 300,
            nonce_window_secs: 600,
            envelope_recovery: true,
            bucket_capacity: 30.0,
            bucket_refill_per_sec: 5.0,
            ingress_capacity: 500.0,
            ingress_refill_per_sec: 100.0,
            reputation_bound: 100,
            warn_threshold: -20,
            ban_threshold: -50,
            unban_after_secs: 3600,
        }
    }
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            mining_batch_size: 2_000_000,
            template_fetch_interval_secs: 5,
            node_address: "127.0.0.1:9000".to_string(),
            public_key_file: "miner.pub.pem".to_string(),
        }
    }
}

impl BlockchainConfig {
    /// Load configuration with the following priority:
    /// 1. Environment variables (highest priority)
    /// 2. .env file
    /// 3. Hardcoded defaults (lowest priority)
    pub fn load() -> Self {
        // Try to load .env file (fails silently if not found)
        dotenvy::dotenv().ok();

        BlockchainConfig {
            network: NetworkConfig::from_env(),
            node: NodeConfig::from_env(),
            mempool: MempoolConfig::from_env(),
            peer: PeerConfig::from_env(),
            mining: MiningConfig::from_env(),
        }
    }

    /// Get or initialize the global configuration
    pub fn global() -> &'static BlockchainConfig {
        CONFIG.get_or_init(BlockchainConfig::load)
    }

    /// Parse MIN_TARGET from hex string
    pub fn min_target(&self) -> U256 {
        let hex_str = self.network.min_target_hex.trim_start_matches("0x");
        U256::from_str_radix(hex_str, 16).unwrap_or_else(|_| {
            tracing::warn!("invalid MIN_TARGET_HEX, using default");
            crate::MIN_TARGET
        })
    }
}

impl NetworkConfig {
    fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            network_id: env_var("NETWORK_ID").unwrap_or(defaults.network_id),
            initial_reward: parse_env("INITIAL_REWARD").unwrap_or(defaults.initial_reward),
            halving_interval: parse_env("HALVING_INTERVAL").unwrap_or(defaults.halving_interval),
            max_supply: parse_env("MAX_SUPPLY").unwrap_or(defaults.max_supply),
            ideal_block_time: parse_env("IDEAL_BLOCK_TIME").unwrap_or(defaults.ideal_block_time),
            difficulty_update_interval: parse_env("DIFFICULTY_UPDATE_INTERVAL")
                .unwrap_or(defaults.difficulty_update_interval),
            max_retarget_factor: parse_env("MAX_RETARGET_FACTOR")
                .unwrap_or(defaults.max_retarget_factor),
            median_time_window: parse_env("MEDIAN_TIME_WINDOW")
                .unwrap_or(defaults.median_time_window),
            max_future_drift_secs: parse_env("MAX_FUTURE_DRIFT")
                .unwrap_or(defaults.max_future_drift_secs),
            max_reorg_depth: parse_env("MAX_REORG_DEPTH").unwrap_or(defaults.max_reorg_depth),
            min_transaction_fee: parse_env("MIN_TRANSACTION_FEE")
                .unwrap_or(defaults.min_transaction_fee),
            max_transaction_size: parse_env("MAX_TRANSACTION_SIZE")
                .unwrap_or(defaults.max_transaction_size),
            max_block_size: parse_env("MAX_BLOCK_SIZE").unwrap_or(defaults.max_block_size),
            block_transaction_cap: parse_env("BLOCK_TX_CAP")
                .unwrap_or(defaults.block_transaction_cap),
            min_target_hex: env_var("MIN_TARGET_HEX").unwrap_or(defaults.min_target_hex),
        }
    }
}

impl NodeConfig {
    fn from_env() -> Self {
        let defaults = Self::default();
        let initial_peers_str = env_var("INITIAL_PEERS").unwrap_or_default();
        let initial_peers = if initial_peers_str.is_empty() {
            defaults.initial_peers
        } else {
            initial_peers_str
                .split(',')
                .map(|s| s.trim().to_string())
                .collect()
        };

        Self {
            port: parse_env("NODE_PORT").unwrap_or(defaults.port),
            data_dir: env_var("DATA_DIR").unwrap_or(defaults.data_dir),
            initial_peers,
            mempool_cleanup_interval_secs: parse_env("MEMPOOL_CLEANUP_INTERVAL")
                .unwrap_or(defaults.mempool_cleanup_interval_secs),
            chain_save_interval_secs: parse_env("CHAIN_SAVE_INTERVAL")
                .unwrap_or(defaults.chain_save_interval_secs),
            orphan_prune_interval_secs: parse_env("ORPHAN_PRUNE_INTERVAL")
                .unwrap_or(defaults.orphan_prune_interval_secs),
            checkpoint_interval: parse_env("CHECKPOINT_INTERVAL")
                .unwrap_or(defaults.checkpoint_interval),
            backup_rotation: parse_env("BACKUP_ROTATION").unwrap_or(defaults.backup_rotation),
            orphan_pool_max_count: parse_env("ORPHAN_POOL_MAX_COUNT")
                .unwrap_or(defaults.orphan_pool_max_count),
            orphan_pool_max_bytes: parse_env("ORPHAN_POOL_MAX_BYTES")
                .unwrap_or(defaults.orphan_pool_max_bytes),
            orphan_ttl_secs: parse_env("ORPHAN_TTL").unwrap_or(defaults.orphan_ttl_secs),
            max_peers: parse_env("MAX_PEERS").unwrap_or(defaults.max_peers),
            request_timeout_secs: parse_env("REQUEST_TIMEOUT")
                .unwrap_or(defaults.request_timeout_secs),
        }
    }
}

impl MempoolConfig {
    fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_count: parse_env("MEMPOOL_MAX_COUNT").unwrap_or(defaults.max_count),
            max_bytes: parse_env("MEMPOOL_MAX_BYTES").unwrap_or(defaults.max_bytes),
            max_transaction_age: parse_env("MAX_MEMPOOL_TX_AGE")
                .unwrap_or(defaults.max_transaction_age),
            replacement_fee_bump: parse_env("REPLACEMENT_FEE_BUMP")
                .unwrap_or(defaults.replacement_fee_bump),
        }
    }
}

impl PeerConfig {
    fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            protocol_version: parse_env("PROTOCOL_VERSION").unwrap_or(defaults.protocol_version),
            max_clock_skew_secs: parse_env("MAX_CLOCK_SKEW")
                .unwrap_or(defaults.max_clock_skew_secs),
            nonce_window_secs: parse_env("NONCE_WINDOW").unwrap_or(defaults.nonce_window_secs),
            envelope_recovery: parse_env("ENVELOPE_RECOVERY")
                .unwrap_or(defaults.envelope_recovery),
            bucket_capacity: parse_env("BUCKET_CAPACITY").unwrap_or(defaults.bucket_capacity),
            bucket_refill_per_sec: parse_env("BUCKET_REFILL")
                .unwrap_or(defaults.bucket_refill_per_sec),
            ingress_capacity: parse_env("INGRESS_CAPACITY").unwrap_or(defaults.ingress_capacity),
            ingress_refill_per_sec: parse_env("INGRESS_REFILL")
                .unwrap_or(defaults.ingress_refill_per_sec),
            reputation_bound: parse_env("REPUTATION_BOUND").unwrap_or(defaults.reputation_bound),
            warn_threshold: parse_env("WARN_THRESHOLD").unwrap_or(defaults.warn_threshold),
            ban_threshold: parse_env("BAN_THRESHOLD").unwrap_or(defaults.ban_threshold),
            unban_after_secs: parse_env("UNBAN_AFTER").unwrap_or(defaults.unban_after_secs),
        }
    }
}

impl MiningConfig {
    fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            mining_batch_size: parse_env("MINING_BATCH_SIZE")
                .unwrap_or(defaults.mining_batch_size),
            template_fetch_interval_secs: parse_env("TEMPLATE_FETCH_INTERVAL")
                .unwrap_or(defaults.template_fetch_interval_secs),
            node_address: env_var("MINER_NODE_ADDRESS").unwrap_or(defaults.node_address),
            public_key_file: env_var("MINER_PUBLIC_KEY").unwrap_or(defaults.public_key_file),
        }
    }
}

impl Saveable for BlockchainConfig {
    fn load<I: Read>(reader: I) -> IoResult<Self> {
        serde_json::from_reader(reader)
            .map_err(|_| IoError::new(IoErrorKind::InvalidData, "Failed to parse config JSON"))
    }

    fn save<O: Write>(&self, writer: O) -> IoResult<()> {
        serde_json::to_writer_pretty(writer, self)
            .map_err(|_| IoError::new(IoErrorKind::InvalidData, "Failed to write config JSON"))
    }
}

// Free accessors for the hot consensus values, so call sites read as
// config::min_target() rather than threading the struct everywhere.

pub fn min_target() -> U256 {
    BlockchainConfig::global().min_target()
}

pub fn initial_reward() -> u64 {
    BlockchainConfig::global().network.initial_reward
}

pub fn halving_interval() -> u64 {
    BlockchainConfig::global().network.halving_interval
}

pub fn max_supply() -> u64 {
    BlockchainConfig::global().network.max_supply
}

pub fn ideal_block_time() -> u64 {
    BlockchainConfig::global().network.ideal_block_time
}

pub fn difficulty_update_interval() -> u64 {
    BlockchainConfig::global().network.difficulty_update_interval
}

pub fn max_retarget_factor() -> u64 {
    BlockchainConfig::global().network.max_retarget_factor
}

pub fn median_time_window() -> usize {
    BlockchainConfig::global().network.median_time_window
}

pub fn max_future_drift() -> i64 {
    BlockchainConfig::global().network.max_future_drift_secs
}

pub fn max_reorg_depth() -> u64 {
    BlockchainConfig::global().network.max_reorg_depth
}

pub fn min_transaction_fee() -> u64 {
    BlockchainConfig::global().network.min_transaction_fee
}

pub fn max_transaction_size() -> usize {
    BlockchainConfig::global().network.max_transaction_size
}

pub fn max_block_size() -> usize {
    BlockchainConfig::global().network.max_block_size
}

pub fn block_transaction_cap() -> usize {
    BlockchainConfig::global().network.block_transaction_cap
}

pub fn max_mempool_transaction_age() -> u64 {
    BlockchainConfig::global().mempool.max_transaction_age
}

/// Helper function to get environment variable
fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Helper function to parse environment variable
fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_var(key)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_loads() {
        let config = BlockchainConfig::default();
        assert_eq!(config.network.initial_reward, 50);
        assert_eq!(config.node.port, 9000);
        assert_eq!(config.peer.max_clock_skew_secs, 300);
    }

    #[test]
    fn test_min_target_parsing() {
        let config = BlockchainConfig::default();
        assert_eq!(config.min_target(), crate::MIN_TARGET);
    }

    #[test]
    fn test_config_json_round_trip() {
        let config = BlockchainConfig::default();
        let mut buf: Vec<u8> = vec![];
        config.save(&mut buf).unwrap();
        let restored = <BlockchainConfig as Saveable>::load(&buf[..]).unwrap();
        assert_eq!(restored.network.max_supply, config.network.max_supply);
        assert_eq!(restored.mempool.max_count, config.mempool.max_count);
    }
}
