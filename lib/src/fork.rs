//! Multi-source fork resolution: the orphan pool, cumulative-work candidate
//! selection and atomic reorganization.
//!
//! Blocks are linked by hash through the chain index, never by object
//! reference; walking a branch is an index lookup per step. An incoming
//! block lands in exactly one of four places: it extends the main tip, it
//! grows a side branch (possibly triggering a reorganization), it waits in
//! the orphan pool for its parent, or it is rejected.

use crate::config::BlockchainConfig;
use crate::error::{NodeError, Result};
use crate::sha256::Hash;
use crate::types::{Block, ChainState};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, error, info, warn};

/// Where an incoming block ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockDisposition {
    /// Extended the main chain; the tip advanced by at least one block
    /// (more when queued orphans collapsed onto the new tip).
    Extended { new_tip: Hash },
    /// Stored on a side branch whose work does not beat the main chain.
    SideBranch { hash: Hash },
    /// A side branch overtook the main chain and the switch was executed.
    Reorganized {
        disconnected: usize,
        connected: usize,
        new_tip: Hash,
    },
    /// Parent unknown; the block waits in the orphan pool. The caller
    /// should request `missing_parent` from whoever relayed the block.
    Orphaned { missing_parent: Hash },
    /// Already known, in the chain index or the orphan pool.
    Duplicate,
}

/// A shape-valid block whose parent is not yet known locally.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct OrphanBlock {
    pub block: Block,
    pub arrival: DateTime<Utc>,
    pub size: usize,
}

#[derive(Clone, Debug, Default)]
pub struct ForkManager {
    orphans: HashMap<Hash, OrphanBlock>,
    orphan_bytes: usize,
    /// Tips of side branches worth tracking as reorganization candidates.
    side_tips: HashSet<Hash>,
    /// Set when a reorganization past the depth limit was refused; the node
    /// stops accepting writes until an operator intervenes.
    paused: bool,
}

impl ForkManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    pub fn orphan_bytes(&self) -> usize {
        self.orphan_bytes
    }

    pub fn contains_orphan(&self, hash: &Hash) -> bool {
        self.orphans.contains_key(hash)
    }

    /// True after a refused over-deep reorganization. Writes should be
    /// refused until an operator clears the condition.
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    /// Run the fork state machine on an incoming block.
    pub fn process_block(
        &mut self,
        chain: &mut ChainState,
        block: Block,
        now: DateTime<Utc>,
    ) -> Result<BlockDisposition> {
        if self.paused {
            return Err(NodeError::invalid_block(
                "node is paused after a refused over-deep reorganization",
            ));
        }

        let hash = block.hash();
        if chain.contains_block(&hash) || self.orphans.contains_key(&hash) {
            return Ok(BlockDisposition::Duplicate);
        }

        let parent = block.header.prev_block_hash;
        let extends_tip = match chain.tip_hash() {
            None => parent == Hash::zero(),
            Some(tip) => parent == tip,
        };

        if extends_tip {
            chain.connect_block(block, now)?;
            self.absorb_orphans(chain);
            self.retire_stale_tips(chain);
            // Absorbed orphans may have built a heavier side branch
            if let Some((disconnected, connected, new_tip)) = self.consider_candidates(chain, now)?
            {
                return Ok(BlockDisposition::Reorganized {
                    disconnected,
                    connected,
                    new_tip,
                });
            }
            let new_tip = chain.tip_hash().expect("BUG: tip exists after connect");
            return Ok(BlockDisposition::Extended { new_tip });
        }

        if chain.contains_block(&parent) {
            let hash = chain.insert_side_block(block, now)?;
            self.side_tips.remove(&parent);
            self.side_tips.insert(hash);
            self.absorb_orphans(chain);
            if let Some((disconnected, connected, new_tip)) = self.consider_candidates(chain, now)?
            {
                return Ok(BlockDisposition::Reorganized {
                    disconnected,
                    connected,
                    new_tip,
                });
            }
            return Ok(BlockDisposition::SideBranch { hash });
        }

        // Parent unknown: keep the block if its shape holds up, and ask the
        // caller to fetch the lineage.
        block.check_shape()?;
        self.add_orphan(block, now);
        Ok(BlockDisposition::Orphaned {
            missing_parent: parent,
        })
    }

    /// Execute the switch to `new_tip`: revert the main chain down to the
    /// fork point, then connect the branch. The whole operation runs on a
    /// staged copy of the chain state and commits only if every connect
    /// succeeds, so readers never observe a half-applied switch.
    ///
    /// Transactions from disconnected blocks return to the mempool when they
    /// are still valid on the new chain.
    pub fn reorganize(
        &mut self,
        chain: &mut ChainState,
        new_tip: Hash,
        now: DateTime<Utc>,
    ) -> Result<(usize, usize)> {
        // Walk the branch back to the fork point
        let mut connect_list: Vec<Hash> = vec![];
        let mut cursor = new_tip;
        while !chain.is_on_main_chain(&cursor) {
            let stored = chain
                .get_block(&cursor)
                .ok_or_else(|| NodeError::UnknownBlock(cursor.to_hex()))?;
            connect_list.push(cursor);
            cursor = stored.block.header.prev_block_hash;
            if cursor == Hash::zero() {
                return Err(NodeError::invalid_block(
                    "candidate branch does not share our genesis",
                ));
            }
        }
        connect_list.reverse();
        let fork_point = cursor;

        let fork_height = chain
            .get_block(&fork_point)
            .expect("BUG: fork point verified on main chain")
            .block
            .header
            .height;
        let tip_height = chain.block_height() - 1;
        let depth = tip_height - fork_height;
        let limit = crate::config::max_reorg_depth();
        if depth > limit {
            self.paused = true;
            error!(
                depth,
                limit,
                "refusing reorganization past the depth limit; node paused"
            );
            return Err(NodeError::ReorgTooDeep { depth, limit });
        }

        info!(
            fork_point = %fork_point,
            disconnecting = depth,
            connecting = connect_list.len(),
            "executing reorganization"
        );

        // Stage the whole switch; the live state is untouched until commit
        let mut staged = chain.clone();
        let mut displaced = vec![];
        while staged.tip_hash() != Some(fork_point) {
            let block = staged.disconnect_tip()?;
            // Coinbases of disconnected blocks cannot be resurrected
            displaced.extend(block.transactions.into_iter().skip(1));
        }
        for hash in &connect_list {
            let block = staged
                .get_block(hash)
                .expect("BUG: connect list built from the index")
                .block
                .clone();
            if let Err(e) = staged.connect_block(block, now) {
                warn!(block = %hash, error = %e, "branch block failed validation, reorganization abandoned");
                // The staged state is discarded; drop the poisoned branch
                // from the live index so it is not selected again.
                chain.purge_side_branch(&new_tip);
                self.side_tips.remove(&new_tip);
                return Err(e);
            }
        }

        let restored = staged.resurrect_transactions(displaced, now);
        debug!(restored, "returned displaced transactions to the mempool");

        let disconnected = depth as usize;
        let connected = connect_list.len();
        *chain = staged;
        self.side_tips.remove(&new_tip);
        self.retire_stale_tips(chain);
        Ok((disconnected, connected))
    }

    /// Pick the best reorganization candidate and switch if it strictly
    /// beats the main chain. Equal work never triggers a switch, and among
    /// equal-work candidates the earliest arrival wins.
    fn consider_candidates(
        &mut self,
        chain: &mut ChainState,
        now: DateTime<Utc>,
    ) -> Result<Option<(usize, usize, Hash)>> {
        let best = self
            .side_tips
            .iter()
            .filter_map(|hash| chain.get_block(hash).map(|stored| (*hash, stored)))
            .max_by(|(_, a), (_, b)| {
                a.chain_work
                    .cmp(&b.chain_work)
                    .then(b.arrival.cmp(&a.arrival))
            })
            .map(|(hash, stored)| (hash, stored.chain_work));

        let Some((candidate, candidate_work)) = best else {
            return Ok(None);
        };
        if candidate_work <= chain.chain_work() {
            return Ok(None);
        }
        let (disconnected, connected) = self.reorganize(chain, candidate, now)?;
        Ok(Some((disconnected, connected, candidate)))
    }

    /// Move every orphan whose parent became known into the chain index.
    /// Chains of orphans collapse in one pass: connecting a parent makes its
    /// orphaned child connectable on the next iteration.
    fn absorb_orphans(&mut self, chain: &mut ChainState) {
        loop {
            let connectable: Vec<Hash> = self
                .orphans
                .iter()
                .filter(|(_, orphan)| chain.contains_block(&orphan.block.header.prev_block_hash))
                .map(|(hash, _)| *hash)
                .collect();
            if connectable.is_empty() {
                return;
            }
            for hash in connectable {
                let orphan = self
                    .orphans
                    .remove(&hash)
                    .expect("BUG: impossible - collected above");
                self.orphan_bytes -= orphan.size;
                let parent = orphan.block.header.prev_block_hash;
                let result = if chain.tip_hash() == Some(parent) {
                    chain.connect_block(orphan.block, orphan.arrival).map(|_| ())
                } else {
                    chain
                        .insert_side_block(orphan.block, orphan.arrival)
                        .map(|inserted| {
                            self.side_tips.remove(&parent);
                            self.side_tips.insert(inserted);
                        })
                };
                match result {
                    Ok(()) => debug!(block = %hash, "orphan attached"),
                    Err(e) => warn!(block = %hash, error = %e, "orphan failed validation, dropped"),
                }
            }
        }
    }

    fn add_orphan(&mut self, block: Block, now: DateTime<Utc>) {
        let config = BlockchainConfig::global();
        let size = block.serialized_size();
        self.orphan_bytes += size;
        self.orphans.insert(
            block.hash(),
            OrphanBlock {
                block,
                arrival: now,
                size,
            },
        );
        // Oldest arrivals are evicted first once either bound is hit
        while self.orphans.len() > config.node.orphan_pool_max_count
            || self.orphan_bytes > config.node.orphan_pool_max_bytes
        {
            let oldest = self
                .orphans
                .iter()
                .min_by_key(|(_, orphan)| orphan.arrival)
                .map(|(hash, _)| *hash);
            match oldest {
                Some(hash) => {
                    let evicted = self
                        .orphans
                        .remove(&hash)
                        .expect("BUG: impossible - selected above");
                    self.orphan_bytes -= evicted.size;
                    debug!(block = %hash, "orphan evicted by pool bounds");
                }
                None => break,
            }
        }
    }

    /// Drop orphans past their time-to-live. Returns how many expired.
    pub fn prune_orphans(&mut self, now: DateTime<Utc>) -> usize {
        let ttl = Duration::seconds(BlockchainConfig::global().node.orphan_ttl_secs as i64);
        let expired: Vec<Hash> = self
            .orphans
            .iter()
            .filter(|(_, orphan)| now - orphan.arrival > ttl)
            .map(|(hash, _)| *hash)
            .collect();
        for hash in &expired {
            let orphan = self
                .orphans
                .remove(hash)
                .expect("BUG: impossible - collected above");
            self.orphan_bytes -= orphan.size;
        }
        expired.len()
    }

    /// Forget side tips that fell behind the main chain beyond the depth
    /// limit; they can never win a permitted reorganization.
    fn retire_stale_tips(&mut self, chain: &ChainState) {
        let limit = crate::config::max_reorg_depth();
        let tip_height = chain.block_height().saturating_sub(1);
        self.side_tips.retain(|hash| match chain.get_block(hash) {
            Some(stored) => {
                !chain.is_on_main_chain(hash)
                    && stored.block.header.height + limit >= tip_height
            }
            None => false,
        });
    }
}

#[cfg(test)]
mod tests;
