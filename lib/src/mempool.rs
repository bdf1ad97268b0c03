//! Unconfirmed transactions awaiting inclusion in a block.
//!
//! Admission follows a fixed pipeline: structural validity (including the
//! per-transaction size cap), input resolution (against the UTXO set or
//! another mempool entry) with signature checks, value conservation, the
//! fee floor, duplicate detection, replace-by-fee and finally the pool
//! caps. The pool caps run after replacement because a successful
//! replacement frees capacity. A rejected transaction reports a
//! [`MempoolRejection`] reason code and leaves the pool untouched.

use crate::config::BlockchainConfig;
use crate::error::MempoolRejection;
use crate::sha256::Hash;
use crate::types::{OutPoint, Transaction, TransactionOutput, UtxoSet};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MempoolEntry {
    pub transaction: Transaction,
    pub inserted: DateTime<Utc>,
    /// Fee per byte x1000, the priority metric.
    pub fee_rate: u64,
    pub size: usize,
    /// Unconfirmed parents: mempool transactions whose outputs this entry
    /// spends. The miner must select parents first.
    pub depends_on: HashSet<Hash>,
    /// Monotonic insertion counter; replacement entries get a fresh value,
    /// and it breaks ordering ties deterministically.
    pub sequence: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Mempool {
    entries: HashMap<Hash, MempoolEntry>,
    /// Which pending transaction spends each outpoint. At most one spender
    /// per outpoint; a second spender must win the replace-by-fee rules.
    spenders: HashMap<OutPoint, Hash>,
    total_bytes: usize,
    next_sequence: u64,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn contains(&self, txid: &Hash) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn get(&self, txid: &Hash) -> Option<&MempoolEntry> {
        self.entries.get(txid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MempoolEntry> {
        self.entries.values()
    }

    /// Whether a pending transaction already spends this outpoint. Wallets
    /// use this to avoid building conflicting spends.
    pub fn is_reserved(&self, outpoint: &OutPoint) -> bool {
        self.spenders.contains_key(outpoint)
    }

    /// Run the admission pipeline on a relayed or submitted transaction.
    /// Returns the txid on acceptance.
    pub fn insert(
        &mut self,
        transaction: Transaction,
        utxos: &UtxoSet,
        now: DateTime<Utc>,
    ) -> Result<Hash, MempoolRejection> {
        let config = BlockchainConfig::global();

        // Structural stage. The per-transaction size cap is a data-model
        // invariant, checked here with its own reason code.
        if transaction.is_coinbase() {
            return Err(MempoolRejection::Coinbase);
        }
        if transaction.serialized_size() > config.network.max_transaction_size {
            return Err(MempoolRejection::TooLarge);
        }
        if transaction.check_shape().is_err() {
            return Err(MempoolRejection::Malformed);
        }
        if transaction.inputs.is_empty() {
            return Err(MempoolRejection::Malformed);
        }

        // Resolve every input against the UTXO set, or against another
        // mempool entry for chained unconfirmed spends, and verify the
        // signature against each resolved owner.
        let signing_bytes = transaction
            .signing_bytes()
            .map_err(|_| MempoolRejection::Malformed)?;
        let mut depends_on: HashSet<Hash> = HashSet::new();
        let mut input_value: u64 = 0;
        for input in &transaction.inputs {
            let resolved: Option<&TransactionOutput> = match utxos.get(&input.prev_output) {
                Some(entry) => Some(&entry.output),
                None => {
                    let parent = self.entries.get(&input.prev_output.txid);
                    let output = parent.and_then(|entry| {
                        entry
                            .transaction
                            .outputs
                            .get(input.prev_output.index as usize)
                    });
                    if output.is_some() {
                        depends_on.insert(input.prev_output.txid);
                    }
                    output
                }
            };
            let Some(output) = resolved else {
                return Err(MempoolRejection::MissingInput);
            };
            if !input.signature.verify(&signing_bytes, &output.pubkey) {
                return Err(MempoolRejection::BadSignature);
            }
            input_value = input_value
                .checked_add(output.value)
                .ok_or(MempoolRejection::ValueMismatch)?;
        }

        if input_value != transaction.output_total() + transaction.fee {
            return Err(MempoolRejection::ValueMismatch);
        }
        if transaction.fee < config.network.min_transaction_fee {
            return Err(MempoolRejection::FeeTooLow);
        }

        let txid = transaction.hash();
        if self.entries.contains_key(&txid) {
            return Err(MempoolRejection::AlreadyKnown);
        }

        // Replace-by-fee: spending an already-reserved outpoint is allowed
        // only with a strictly higher fee-rate plus an absolute bump over
        // everything displaced.
        let conflicts: HashSet<Hash> = transaction
            .inputs
            .iter()
            .filter_map(|input| self.spenders.get(&input.prev_output).copied())
            .collect();
        let size = transaction.serialized_size();
        let fee_rate = transaction.fee_rate();
        if !conflicts.is_empty() {
            let mut displaced_fees: u64 = 0;
            for conflict in &conflicts {
                let entry = self
                    .entries
                    .get(conflict)
                    .expect("BUG: spender index out of sync with entries");
                if fee_rate <= entry.fee_rate {
                    return Err(MempoolRejection::Conflict);
                }
                displaced_fees += entry.transaction.fee;
            }
            if transaction.fee < displaced_fees + config.mempool.replacement_fee_bump {
                return Err(MempoolRejection::Conflict);
            }
            for conflict in conflicts {
                self.remove_with_descendants(&conflict);
            }
        }

        self.index_entry(MempoolEntry {
            transaction,
            inserted: now,
            fee_rate,
            size,
            depends_on,
            sequence: self.next_sequence,
        });
        self.next_sequence += 1;

        // Enforce the caps, dropping the cheapest entries. If the incoming
        // transaction itself is the cheapest it is the one dropped.
        self.evict_to_caps(config.mempool.max_count, config.mempool.max_bytes);
        if !self.entries.contains_key(&txid) {
            return Err(MempoolRejection::PoolFull);
        }
        Ok(txid)
    }

    fn index_entry(&mut self, entry: MempoolEntry) {
        let txid = entry.transaction.hash();
        for input in &entry.transaction.inputs {
            self.spenders.insert(input.prev_output, txid);
        }
        self.total_bytes += entry.size;
        self.entries.insert(txid, entry);
    }

    /// Remove an entry and every chained descendant that spent its outputs.
    /// Returns the removed transactions.
    pub fn remove_with_descendants(&mut self, txid: &Hash) -> Vec<Transaction> {
        let mut removed = vec![];
        let mut queue = vec![*txid];
        while let Some(current) = queue.pop() {
            let Some(entry) = self.entries.remove(&current) else {
                continue;
            };
            self.total_bytes -= entry.size;
            for input in &entry.transaction.inputs {
                if self.spenders.get(&input.prev_output) == Some(&current) {
                    self.spenders.remove(&input.prev_output);
                }
            }
            // Children spend this entry's outputs
            for index in 0..entry.transaction.outputs.len() {
                let outpoint = OutPoint::new(current, index as u32);
                if let Some(child) = self.spenders.get(&outpoint) {
                    queue.push(*child);
                }
            }
            removed.push(entry.transaction);
        }
        removed
    }

    /// Drop everything a freshly connected block made obsolete: the
    /// transactions it confirmed, plus any entry that now double-spends an
    /// outpoint the block consumed.
    pub fn remove_confirmed(&mut self, block: &crate::types::Block) {
        for tx in &block.transactions {
            let txid = tx.hash();
            if self.entries.contains_key(&txid) {
                let entry = self
                    .entries
                    .remove(&txid)
                    .expect("BUG: impossible - checked above");
                self.total_bytes -= entry.size;
                for input in &entry.transaction.inputs {
                    if self.spenders.get(&input.prev_output) == Some(&txid) {
                        self.spenders.remove(&input.prev_output);
                    }
                }
                // A confirmed parent no longer gates its children
                for child in self.entries.values_mut() {
                    child.depends_on.remove(&txid);
                }
            }
            for input in &tx.inputs {
                if let Some(conflicting) = self.spenders.get(&input.prev_output).copied() {
                    self.remove_with_descendants(&conflicting);
                }
            }
        }
    }

    /// Cleanup mempool - remove transactions older than the configured age.
    /// Returns the expired txids.
    pub fn expire(&mut self, now: DateTime<Utc>) -> Vec<Hash> {
        let max_age = Duration::seconds(crate::config::max_mempool_transaction_age() as i64);
        let expired: Vec<Hash> = self
            .entries
            .iter()
            .filter(|(_, entry)| now - entry.inserted > max_age)
            .map(|(txid, _)| *txid)
            .collect();
        for txid in &expired {
            self.remove_with_descendants(txid);
        }
        expired
    }

    /// Select transactions for a block template: fee-rate descending, but a
    /// child is never taken before its unconfirmed parent.
    pub fn take_for_block(&self, cap: usize) -> Vec<Transaction> {
        let mut candidates: Vec<&MempoolEntry> = self.entries.values().collect();
        candidates.sort_by(|a, b| {
            b.fee_rate
                .cmp(&a.fee_rate)
                .then(a.inserted.cmp(&b.inserted))
                .then(a.sequence.cmp(&b.sequence))
        });

        let mut selected: Vec<Transaction> = vec![];
        let mut selected_ids: HashSet<Hash> = HashSet::new();
        // A child waiting on an unselected parent is skipped this pass and
        // reconsidered once the parent is in; with fee-rate descending
        // order, repeated passes terminate quickly at block scale.
        let mut progress = true;
        while progress && selected.len() < cap {
            progress = false;
            for entry in &candidates {
                if selected.len() >= cap {
                    break;
                }
                let txid = entry.transaction.hash();
                if selected_ids.contains(&txid) {
                    continue;
                }
                if entry
                    .depends_on
                    .iter()
                    .all(|parent| selected_ids.contains(parent))
                {
                    selected_ids.insert(txid);
                    selected.push(entry.transaction.clone());
                    progress = true;
                }
            }
        }
        selected
    }

    fn evict_to_caps(&mut self, max_count: usize, max_bytes: usize) {
        while self.entries.len() > max_count || self.total_bytes > max_bytes {
            // Lowest fee-rate goes first; oldest insertion breaks ties
            let victim = self
                .entries
                .iter()
                .min_by(|(_, a), (_, b)| {
                    a.fee_rate
                        .cmp(&b.fee_rate)
                        .then(a.inserted.cmp(&b.inserted))
                        .then(a.sequence.cmp(&b.sequence))
                })
                .map(|(txid, _)| *txid);
            match victim {
                Some(txid) => {
                    self.remove_with_descendants(&txid);
                }
                None => break,
            }
        }
    }
}
