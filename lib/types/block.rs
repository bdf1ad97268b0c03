use super::blockchain::UtxoSet;
use super::transaction::{OutPoint, Transaction};
use crate::error::{NodeError, Result};
use crate::sha256::Hash;
use crate::util::{serialized_size, MerkleRoot};
use crate::U256;
use crate::util::Saveable;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{
    Error as IoError, ErrorKind as IoErrorKind, Read as IoRead, Result as IoResult, Write as IoWrite,
};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    /// The time when the block was created.
    pub timestamp: DateTime<Utc>,
    /// Number only used once, incremented while mining.
    pub nonce: u64,
    /// The hash of the previous block in the chain. All zeroes for genesis.
    pub prev_block_hash: Hash,
    /// Root of the Merkle tree over this block's transactions.
    pub merkle_root: MerkleRoot,
    /// The proof-of-work target this block was mined against.
    pub target: U256,
    /// Height of this block; genesis is 0.
    pub height: u64,
}

impl BlockHeader {
    pub fn new(
        timestamp: DateTime<Utc>,
        nonce: u64,
        prev_block_hash: Hash,
        merkle_root: MerkleRoot,
        target: U256,
        height: u64,
    ) -> Self {
        BlockHeader {
            timestamp,
            nonce,
            prev_block_hash,
            merkle_root,
            target,
            height,
        }
    }

    /// The block hash is the hash of the serialized header.
    pub fn hash(&self) -> Hash {
        Hash::hash(self)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Block {
            header,
            transactions,
        }
    }

    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn serialized_size(&self) -> usize {
        serialized_size(self)
    }

    /// Sum of the declared fees of all non-coinbase transactions. Only
    /// meaningful once `verify_transactions` has confirmed the declarations
    /// balance against the UTXO set.
    pub fn total_fees(&self) -> u64 {
        self.transactions
            .iter()
            .skip(1)
            .map(|tx| tx.fee)
            .sum()
    }

    /// Shape validity: everything that can be checked without the UTXO set
    /// or the chain context.
    ///
    /// - non-empty, first transaction is the coinbase, no other coinbase
    /// - proof of work holds against the stated target
    /// - the Merkle root commits to the transaction list
    /// - size and transaction-count caps
    pub fn check_shape(&self) -> Result<()> {
        if self.transactions.is_empty() {
            return Err(NodeError::invalid_block("block has no transactions"));
        }
        if !self.transactions[0].is_coinbase() {
            return Err(NodeError::invalid_block(
                "first transaction is not a coinbase",
            ));
        }
        for tx in self.transactions.iter().skip(1) {
            if tx.is_coinbase() {
                return Err(NodeError::invalid_block("more than one coinbase"));
            }
        }
        for tx in &self.transactions {
            tx.check_shape()?;
        }
        if !self.header.hash().matches_target(self.header.target) {
            return Err(NodeError::invalid_block_header(
                "hash does not match the stated target",
            ));
        }
        let calculated_merkle_root = MerkleRoot::calculate(&self.transactions);
        if calculated_merkle_root != self.header.merkle_root {
            return Err(NodeError::InvalidMerkleRoot);
        }
        if self.transactions.len() > crate::config::block_transaction_cap() {
            return Err(NodeError::invalid_block("too many transactions"));
        }
        if self.serialized_size() > crate::config::max_block_size() {
            return Err(NodeError::invalid_block("block exceeds the size cap"));
        }
        Ok(())
    }

    /// Contextual validation of the block body against the UTXO set as of
    /// the parent block.
    ///
    /// Every non-coinbase transaction must:
    /// - pay at least the configured fee floor
    /// - spend only outputs present in `utxos`
    /// - not spend an output another transaction in this block spends
    /// - carry a valid signature from the owner of every spent output
    /// - conserve value exactly: sum(inputs) = sum(outputs) + fee
    ///
    /// The coinbase may pay out at most `reward_ceiling` plus the collected
    /// fees. `reward_ceiling` is the halving-schedule subsidy already clipped
    /// by the remaining supply.
    pub fn verify_transactions(&self, utxos: &UtxoSet, reward_ceiling: u64) -> Result<()> {
        let mut spent_in_block: HashMap<OutPoint, Hash> = HashMap::new();
        let mut fees: u64 = 0;

        for tx in self.transactions.iter().skip(1) {
            // The fee floor binds at the ledger level, not just for relay;
            // a block built around the mempool does not get to skip it
            if tx.fee < crate::config::min_transaction_fee() {
                return Err(NodeError::invalid_transaction(format!(
                    "fee {} below the configured floor",
                    tx.fee
                )));
            }
            let signing_bytes = tx.signing_bytes()?;
            let mut input_value: u64 = 0;

            for input in &tx.inputs {
                let Some(entry) = utxos.get(&input.prev_output) else {
                    return Err(NodeError::invalid_transaction(format!(
                        "input {}:{} not found in UTXO set",
                        input.prev_output.txid, input.prev_output.index
                    )));
                };
                if spent_in_block
                    .insert(input.prev_output, tx.hash())
                    .is_some()
                {
                    return Err(NodeError::invalid_transaction(
                        "output spent twice within the block",
                    ));
                }
                if !input.signature.verify(&signing_bytes, &entry.output.pubkey) {
                    return Err(NodeError::InvalidSignature);
                }
                input_value = input_value
                    .checked_add(entry.output.value)
                    .ok_or_else(|| NodeError::invalid_transaction("input value overflow"))?;
            }

            let output_value = tx.output_total();
            if input_value != output_value + tx.fee {
                return Err(NodeError::invalid_transaction(format!(
                    "value not conserved: inputs {} != outputs {} + fee {}",
                    input_value, output_value, tx.fee
                )));
            }
            fees += tx.fee;
        }

        let coinbase_total = self.transactions[0].output_total();
        if coinbase_total > reward_ceiling + fees {
            return Err(NodeError::SupplyCapExceeded {
                reason: format!(
                    "coinbase pays {} but ceiling is {} + {} fees",
                    coinbase_total, reward_ceiling, fees
                ),
            });
        }
        Ok(())
    }
}

impl Saveable for Block {
    fn load<I: IoRead>(reader: I) -> IoResult<Self> {
        ciborium::de::from_reader(reader)
            .map_err(|_| IoError::new(IoErrorKind::InvalidData, "Failed to deserialize Block"))
    }

    fn save<O: IoWrite>(&self, writer: O) -> IoResult<()> {
        ciborium::ser::into_writer(self, writer)
            .map_err(|_| IoError::new(IoErrorKind::InvalidData, "Failed to serialize Block"))
    }
}
