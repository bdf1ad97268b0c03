use crate::crypto::{canonical_bytes, PublicKey, Signature};
use crate::error::{NodeError, Result};
use crate::sha256::Hash;
use crate::util::{serialized_size, Saveable};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::{
    Error as IoError, ErrorKind as IoErrorKind, Read as IoRead, Result as IoResult, Write as IoWrite,
};

/// Reference to a previous transaction output by (txid, output index).
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutPoint {
    pub txid: Hash,
    pub index: u32,
}

impl OutPoint {
    pub fn new(txid: Hash, index: u32) -> Self {
        OutPoint { txid, index }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TransactionInput {
    /// The unspent output being consumed.
    pub prev_output: OutPoint,
    /// Signature over the transaction signing pre-image, made with the key
    /// that owns the referenced output.
    pub signature: Signature,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TransactionOutput {
    /// Amount in base units.
    pub value: u64,
    /// Recipient key. The address form is derived from this on demand.
    pub pubkey: PublicKey,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub inputs: Vec<TransactionInput>,
    pub outputs: Vec<TransactionOutput>,
    /// Explicit miner fee. Must equal sum(inputs) - sum(outputs) exactly.
    pub fee: u64,
    pub timestamp: DateTime<Utc>,
    /// Optional wallet-chosen nonce to distinguish otherwise identical
    /// payments.
    pub nonce: Option<u64>,
}

/// The signed portion of a transaction: every field except the signatures.
/// Serialized as canonical JSON (sorted keys, compact separators) so signer
/// and verifier derive identical bytes.
#[derive(Serialize)]
struct SigningPayload<'a> {
    fee: u64,
    inputs: &'a [OutPoint],
    nonce: Option<u64>,
    outputs: &'a [TransactionOutput],
    timestamp: i64,
}

impl Transaction {
    pub fn new(inputs: Vec<TransactionInput>, outputs: Vec<TransactionOutput>, fee: u64) -> Self {
        Transaction {
            inputs,
            outputs,
            fee,
            timestamp: Utc::now(),
            nonce: None,
        }
    }

    /// A coinbase transaction mints the block reward: no inputs, a single
    /// output, zero fee.
    pub fn coinbase(output: TransactionOutput) -> Self {
        Transaction::new(vec![], vec![output], 0)
    }

    /// The transaction id: content hash over the full serialization.
    pub fn hash(&self) -> Hash {
        Hash::hash(self)
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn output_total(&self) -> u64 {
        self.outputs.iter().map(|output| output.value).sum()
    }

    pub fn serialized_size(&self) -> usize {
        serialized_size(self)
    }

    /// Fee per byte, scaled by 1000 to keep integer precision. This is the
    /// mempool's priority metric.
    pub fn fee_rate(&self) -> u64 {
        self.fee.saturating_mul(1000) / self.serialized_size().max(1) as u64
    }

    /// Canonical pre-image bytes that every input signature commits to.
    pub fn signing_bytes(&self) -> Result<Vec<u8>> {
        let outpoints: Vec<OutPoint> = self.inputs.iter().map(|input| input.prev_output).collect();
        Self::signing_bytes_for(
            &outpoints,
            &self.outputs,
            self.fee,
            self.timestamp,
            self.nonce,
        )
    }

    /// Same pre-image, computed before the inputs carry signatures. Wallets
    /// use this to sign while assembling the transaction.
    pub fn signing_bytes_for(
        inputs: &[OutPoint],
        outputs: &[TransactionOutput],
        fee: u64,
        timestamp: DateTime<Utc>,
        nonce: Option<u64>,
    ) -> Result<Vec<u8>> {
        canonical_bytes(&SigningPayload {
            fee,
            inputs,
            nonce,
            outputs,
            timestamp: timestamp.timestamp(),
        })
    }

    /// Structural validity: everything that can be checked without the UTXO
    /// set. Value conservation and signatures are contextual and live in the
    /// block/mempool validation paths.
    pub fn check_shape(&self) -> Result<()> {
        if self.outputs.is_empty() {
            return Err(NodeError::invalid_transaction("no outputs"));
        }
        if self.is_coinbase() {
            if self.outputs.len() != 1 {
                return Err(NodeError::invalid_transaction(
                    "coinbase must have exactly one output",
                ));
            }
            if self.fee != 0 {
                return Err(NodeError::invalid_transaction("coinbase cannot carry a fee"));
            }
        }
        let mut seen: HashSet<OutPoint> = HashSet::new();
        for input in &self.inputs {
            if !seen.insert(input.prev_output) {
                return Err(NodeError::invalid_transaction(
                    "input referenced twice within the transaction",
                ));
            }
        }
        // Guard against overflow before any balance arithmetic
        let mut total: u64 = self.fee;
        for output in &self.outputs {
            total = total
                .checked_add(output.value)
                .ok_or_else(|| NodeError::invalid_transaction("output value overflow"))?;
        }
        if self.serialized_size() > crate::config::max_transaction_size() {
            return Err(NodeError::invalid_transaction(
                "transaction exceeds the size cap",
            ));
        }
        Ok(())
    }
}

impl Saveable for Transaction {
    fn load<I: IoRead>(reader: I) -> IoResult<Self> {
        ciborium::de::from_reader(reader).map_err(|_| {
            IoError::new(IoErrorKind::InvalidData, "Failed to deserialize Transaction")
        })
    }

    fn save<O: IoWrite>(&self, writer: O) -> IoResult<()> {
        ciborium::ser::into_writer(self, writer)
            .map_err(|_| IoError::new(IoErrorKind::InvalidData, "Failed to serialize Transaction"))
    }
}
