use super::{Block, BlockHeader, OutPoint, Transaction, TransactionOutput};
use crate::config;
use crate::consensus;
use crate::error::{NodeError, Result};
use crate::mempool::Mempool;
use crate::sha256::Hash;
use crate::util::Saveable;
use crate::U256;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Error as IoError, ErrorKind as IoErrorKind, Read, Result as IoResult, Write};

/// A spendable ledger entry: the output itself plus the context needed to
/// apply policy (coinbase maturity, age).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct UtxoEntry {
    pub output: TransactionOutput,
    /// Height of the block that created this output.
    pub height: u64,
    pub coinbase: bool,
}

pub type UtxoSet = HashMap<OutPoint, UtxoEntry>;

/// The image of everything a block destroyed, recorded at apply time so the
/// block can be reverted exactly during a reorganization.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct UndoData {
    pub spent: Vec<(OutPoint, UtxoEntry)>,
}

/// A block held in the chain index. Blocks are immutable once stored; main
/// and side blocks live in the same hash-indexed arena and are linked by
/// parent hash, never by object reference.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct StoredBlock {
    pub block: Block,
    /// Cumulative work of the chain ending at this block.
    pub chain_work: U256,
    /// Network target that applies to this block's child. Restored on
    /// disconnect so the difficulty schedule survives reorganizations.
    pub next_target: U256,
    /// Present while the block sits on the main chain.
    pub undo: Option<UndoData>,
    /// When this node first saw the block. Deterministic tie-breaker among
    /// equal-work candidates.
    pub arrival: DateTime<Utc>,
}

/// The authoritative chain state: block arena, main-chain index, UTXO set
/// and supply counter. This is the single serialization point for all
/// mutations; apply and revert are atomic, and the UTXO set is never touched
/// except through them.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ChainState {
    blocks: HashMap<Hash, StoredBlock>,
    main_chain: Vec<Hash>,
    utxos: UtxoSet,
    target: U256,
    supply: u64,
    #[serde(default, skip_serializing)]
    mempool: Mempool,
}

impl Default for ChainState {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainState {
    pub fn new() -> Self {
        ChainState {
            blocks: HashMap::new(),
            main_chain: vec![],
            utxos: HashMap::new(),
            target: config::min_target(),
            supply: 0,
            mempool: Mempool::new(),
        }
    }

    pub fn utxos(&self) -> &UtxoSet {
        &self.utxos
    }

    pub fn target(&self) -> U256 {
        self.target
    }

    pub fn mempool(&self) -> &Mempool {
        &self.mempool
    }

    pub fn mempool_mut(&mut self) -> &mut Mempool {
        &mut self.mempool
    }

    /// Number of blocks on the main chain. The next block to connect takes
    /// this value as its height, so genesis lands at height 0.
    pub fn block_height(&self) -> u64 {
        self.main_chain.len() as u64
    }

    pub fn tip_hash(&self) -> Option<Hash> {
        self.main_chain.last().copied()
    }

    pub fn tip(&self) -> Option<&StoredBlock> {
        self.tip_hash().map(|hash| {
            self.blocks
                .get(&hash)
                .expect("BUG: main chain entry missing from block index")
        })
    }

    /// Cumulative work of the main chain.
    pub fn chain_work(&self) -> U256 {
        self.tip().map(|stored| stored.chain_work).unwrap_or_default()
    }

    pub fn get_block(&self, hash: &Hash) -> Option<&StoredBlock> {
        self.blocks.get(hash)
    }

    pub fn contains_block(&self, hash: &Hash) -> bool {
        self.blocks.contains_key(hash)
    }

    pub fn is_on_main_chain(&self, hash: &Hash) -> bool {
        self.blocks
            .get(hash)
            .map(|stored| {
                self.main_chain
                    .get(stored.block.header.height as usize)
                    .is_some_and(|at_height| at_height == hash)
            })
            .unwrap_or(false)
    }

    pub fn main_chain(&self) -> impl Iterator<Item = &Hash> {
        self.main_chain.iter()
    }

    pub fn block_at_height(&self, height: u64) -> Option<&StoredBlock> {
        self.main_chain
            .get(height as usize)
            .map(|hash| &self.blocks[hash])
    }

    pub fn circulating_supply(&self) -> u64 {
        self.supply
    }

    /// Median timestamp of the last eleven main-chain blocks. A new block's
    /// timestamp must be strictly greater than this.
    pub fn median_time_past(&self) -> Option<DateTime<Utc>> {
        if self.main_chain.is_empty() {
            return None;
        }
        let window = config::median_time_window().min(self.main_chain.len());
        let mut timestamps: Vec<DateTime<Utc>> = self.main_chain[self.main_chain.len() - window..]
            .iter()
            .map(|hash| self.blocks[hash].block.header.timestamp)
            .collect();
        timestamps.sort();
        Some(timestamps[timestamps.len() / 2])
    }

    /// Reward available to the next block's coinbase: the halving-schedule
    /// subsidy, clipped so the supply cap can never be crossed. Once the cap
    /// is reached this returns 0 and blocks remain valid on fees alone.
    pub fn calculate_block_reward(&self) -> u64 {
        let subsidy = consensus::block_subsidy(self.block_height());
        subsidy.min(config::max_supply().saturating_sub(self.supply))
    }

    /// Validate a block that extends the current tip and apply it to the
    /// ledger. Either every effect commits (UTXO mutations, supply, mempool
    /// removal, difficulty adjustment) or none do. Returns the fee total.
    pub fn connect_block(&mut self, block: Block, now: DateTime<Utc>) -> Result<u64> {
        let hash = block.hash();
        if self.is_on_main_chain(&hash) {
            return Err(NodeError::invalid_block("block already on the main chain"));
        }

        // Linkage and height
        match self.tip_hash() {
            None => {
                if block.header.prev_block_hash != Hash::zero() {
                    return Err(NodeError::invalid_block(
                        "genesis must reference the zero hash",
                    ));
                }
                if block.header.height != 0 {
                    return Err(NodeError::invalid_block("genesis height must be 0"));
                }
            }
            Some(tip_hash) => {
                if block.header.prev_block_hash != tip_hash {
                    return Err(NodeError::invalid_block("does not extend the current tip"));
                }
                if block.header.height != self.block_height() {
                    return Err(NodeError::invalid_block(format!(
                        "height {} does not follow tip height {}",
                        block.header.height,
                        self.block_height() - 1
                    )));
                }
            }
        }

        // The stated target must be the network target for this height;
        // check_shape then proves the work against it.
        if block.header.target != self.target {
            return Err(NodeError::invalid_block_header(
                "target does not match the network difficulty",
            ));
        }
        block.check_shape()?;

        // Timestamp rules: strictly above the median past, bounded future
        if let Some(median) = self.median_time_past() {
            if block.header.timestamp <= median {
                return Err(NodeError::invalid_block_header(
                    "timestamp not above the median of recent ancestors",
                ));
            }
        }
        if block.header.timestamp > now + Duration::seconds(config::max_future_drift()) {
            return Err(NodeError::invalid_block_header(
                "timestamp too far in the future",
            ));
        }

        let reward_ceiling = self.calculate_block_reward();
        block.verify_transactions(&self.utxos, reward_ceiling)?;

        // Validation is complete; no fallible step below this line.
        let mut undo = UndoData::default();
        for tx in &block.transactions {
            for input in &tx.inputs {
                let entry = self
                    .utxos
                    .remove(&input.prev_output)
                    .expect("BUG: impossible - presence validated above");
                undo.spent.push((input.prev_output, entry));
            }
            let txid = tx.hash();
            for (index, output) in tx.outputs.iter().enumerate() {
                self.utxos.insert(
                    OutPoint::new(txid, index as u32),
                    UtxoEntry {
                        output: output.clone(),
                        height: block.header.height,
                        coinbase: tx.is_coinbase(),
                    },
                );
            }
        }

        let fees = block.total_fees();
        let coinbase_total = block.transactions[0].output_total();
        self.supply = self.supply + coinbase_total - fees;

        let parent_work = self.tip().map(|tip| tip.chain_work).unwrap_or_default();
        let chain_work = parent_work + consensus::block_work(block.header.target);

        self.mempool.remove_confirmed(&block);

        // A side block being connected during a reorg keeps its original
        // arrival time.
        let arrival = self
            .blocks
            .get(&hash)
            .map(|existing| existing.arrival)
            .unwrap_or(now);
        self.blocks.insert(
            hash,
            StoredBlock {
                block,
                chain_work,
                next_target: self.target,
                undo: Some(undo),
                arrival,
            },
        );
        self.main_chain.push(hash);
        self.try_adjust_target();
        self.blocks
            .get_mut(&hash)
            .expect("BUG: impossible - inserted above")
            .next_target = self.target;
        Ok(fees)
    }

    /// Reverse of `connect_block`: pop the tip, restore every UTXO it spent
    /// and remove every UTXO it created. The block stays in the side index
    /// so it can be re-attached without a re-download. Returns the
    /// disconnected block.
    pub fn disconnect_tip(&mut self) -> Result<Block> {
        let tip_hash = self
            .main_chain
            .pop()
            .ok_or_else(|| NodeError::invalid_block("cannot disconnect an empty chain"))?;
        let stored = self
            .blocks
            .get_mut(&tip_hash)
            .expect("BUG: main chain entry missing from block index");
        let undo = stored.undo.take().ok_or_else(|| {
            NodeError::corruption("undo data missing for the tip block")
        })?;
        let block = stored.block.clone();

        for tx in &block.transactions {
            let txid = tx.hash();
            for index in 0..tx.outputs.len() {
                self.utxos.remove(&OutPoint::new(txid, index as u32));
            }
        }
        for (outpoint, entry) in undo.spent {
            self.utxos.insert(outpoint, entry);
        }

        let fees = block.total_fees();
        let coinbase_total = block.transactions[0].output_total();
        self.supply = self.supply + fees - coinbase_total;

        self.target = match self.main_chain.last() {
            Some(parent) => self.blocks[parent].next_target,
            None => config::min_target(),
        };
        Ok(block)
    }

    /// Record a shape-valid block on a side branch. The block is not applied
    /// to the ledger; full contextual validation happens if and when a
    /// reorganization connects it. The parent must already be in the index.
    pub fn insert_side_block(&mut self, block: Block, now: DateTime<Utc>) -> Result<Hash> {
        let hash = block.hash();
        if self.blocks.contains_key(&hash) {
            return Ok(hash);
        }
        block.check_shape()?;
        let parent = self
            .blocks
            .get(&block.header.prev_block_hash)
            .ok_or_else(|| NodeError::OrphanBlock(block.header.prev_block_hash.to_hex()))?;
        if block.header.height != parent.block.header.height + 1 {
            return Err(NodeError::invalid_block(
                "height does not follow the parent",
            ));
        }
        let chain_work = parent.chain_work + consensus::block_work(block.header.target);
        let next_target = parent.next_target;
        self.blocks.insert(
            hash,
            StoredBlock {
                block,
                chain_work,
                next_target,
                undo: None,
                arrival: now,
            },
        );
        Ok(hash)
    }

    /// Run the mempool admission pipeline against the current UTXO set.
    pub fn submit_transaction(
        &mut self,
        transaction: Transaction,
        now: DateTime<Utc>,
    ) -> std::result::Result<Hash, crate::error::MempoolRejection> {
        self.mempool.insert(transaction, &self.utxos, now)
    }

    /// Drop a side block and every stored descendant. Used when a branch
    /// fails contextual validation during a reorganization, so the poisoned
    /// candidate is never selected again. Main-chain blocks are untouched.
    pub fn purge_side_branch(&mut self, tip: &Hash) {
        let mut cursor = *tip;
        while let Some(stored) = self.blocks.get(&cursor) {
            if self.is_on_main_chain(&cursor) {
                break;
            }
            let parent = stored.block.header.prev_block_hash;
            self.blocks.remove(&cursor);
            cursor = parent;
        }
    }

    /// Re-admit transactions displaced by a reorganization. Entries that are
    /// no longer valid on the new chain are silently dropped. Returns how
    /// many made it back.
    pub fn resurrect_transactions(
        &mut self,
        transactions: Vec<Transaction>,
        now: DateTime<Utc>,
    ) -> usize {
        let mut restored = 0;
        for tx in transactions {
            if tx.is_coinbase() {
                continue;
            }
            if self.mempool.insert(tx, &self.utxos, now).is_ok() {
                restored += 1;
            }
        }
        restored
    }

    /// Exponentially spaced back-hashes from the tip, used by lineage
    /// catch-up to locate a shared ancestor with a remote peer.
    pub fn locator(&self) -> Vec<Hash> {
        let mut hashes = vec![];
        let mut step: u64 = 1;
        let mut index = self.main_chain.len() as i64 - 1;
        while index >= 0 {
            hashes.push(self.main_chain[index as usize]);
            if hashes.len() >= 10 {
                step *= 2;
            }
            index -= step as i64;
        }
        // Always anchor at genesis
        if let Some(genesis) = self.main_chain.first() {
            if hashes.last() != Some(genesis) {
                hashes.push(*genesis);
            }
        }
        hashes
    }

    /// Headers following the first locator entry found on our main chain.
    /// Unknown locators fall back to the start of the chain.
    pub fn headers_after(&self, locator: &[Hash], max: usize) -> Vec<BlockHeader> {
        let start = locator
            .iter()
            .find_map(|hash| {
                self.is_on_main_chain(hash)
                    .then(|| self.blocks[hash].block.header.height as usize + 1)
            })
            .unwrap_or(0);
        self.main_chain[start.min(self.main_chain.len())..]
            .iter()
            .take(max)
            .map(|hash| self.blocks[hash].block.header)
            .collect()
    }

    /// Recompute the UTXO set, supply counter and per-block undo images by
    /// replaying the main chain from genesis. Used after loading state whose
    /// derived indexes may be stale.
    pub fn rebuild_utxos(&mut self) {
        self.utxos.clear();
        self.supply = 0;
        let main_chain = self.main_chain.clone();
        for hash in main_chain {
            let block = self.blocks[&hash].block.clone();
            let mut undo = UndoData::default();
            for tx in &block.transactions {
                for input in &tx.inputs {
                    if let Some(entry) = self.utxos.remove(&input.prev_output) {
                        undo.spent.push((input.prev_output, entry));
                    }
                }
                let txid = tx.hash();
                for (index, output) in tx.outputs.iter().enumerate() {
                    self.utxos.insert(
                        OutPoint::new(txid, index as u32),
                        UtxoEntry {
                            output: output.clone(),
                            height: block.header.height,
                            coinbase: tx.is_coinbase(),
                        },
                    );
                }
            }
            let fees = block.total_fees();
            let coinbase_total = block.transactions[0].output_total();
            self.supply = self.supply + coinbase_total - fees;
            self.blocks
                .get_mut(&hash)
                .expect("BUG: impossible - iterating own index")
                .undo = Some(undo);
        }
    }

    /// Adjusts the mining difficulty target to maintain consistent block
    /// times. Runs every `difficulty_update_interval` blocks and scales the
    /// target by observed/expected timespan:
    ///
    /// ```text
    /// new_target = current_target x (actual_time / target_time)
    /// ```
    ///
    /// The step is clamped to the configured retarget factor in both
    /// directions so a single anomalous window cannot swing the difficulty,
    /// and the target never rises above the configured minimum difficulty.
    pub fn try_adjust_target(&mut self) {
        if self.main_chain.is_empty() {
            return;
        }
        let interval = config::difficulty_update_interval() as usize;
        if self.main_chain.len() % interval != 0 {
            return;
        }

        let start_time = self.blocks[&self.main_chain[self.main_chain.len() - interval]]
            .block
            .header
            .timestamp;
        let end_time = self.blocks[self.main_chain.last().expect("BUG: checked non-empty")]
            .block
            .header
            .timestamp;
        let time_diff_seconds = (end_time - start_time).num_seconds();
        let target_seconds = config::ideal_block_time() * interval as u64;

        self.target = consensus::retarget(self.target, time_diff_seconds, target_seconds);
    }
}

impl Saveable for ChainState {
    fn load<I: Read>(reader: I) -> IoResult<Self> {
        ciborium::de::from_reader(reader)
            .map_err(|_| IoError::new(IoErrorKind::InvalidData, "Failed to deserialize ChainState"))
    }

    fn save<O: Write>(&self, writer: O) -> IoResult<()> {
        ciborium::ser::into_writer(self, writer)
            .map_err(|_| IoError::new(IoErrorKind::InvalidData, "Failed to serialize ChainState"))
    }
}
