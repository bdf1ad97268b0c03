//! Transaction assembly for wallet collaborators: greedy coin selection,
//! change handling and input signing against the core's canonical pre-image.

use crate::crypto::{PrivateKey, PublicKey, Signature};
use crate::error::{NodeError, Result};
use crate::mempool::Mempool;
use crate::types::{OutPoint, Transaction, TransactionInput, TransactionOutput, UtxoSet};
use chrono::Utc;

/// A key pair the wallet can spend with.
#[derive(Clone)]
pub struct OwnedKey {
    pub public: PublicKey,
    pub private: PrivateKey,
}

impl OwnedKey {
    pub fn from_private(private: PrivateKey) -> Self {
        OwnedKey {
            public: private.public_key(),
            private,
        }
    }
}

/// Spendable balance across the given keys, excluding outputs reserved by
/// pending mempool spends.
pub fn spendable_balance(keys: &[OwnedKey], utxos: &UtxoSet, mempool: &Mempool) -> u64 {
    utxos
        .iter()
        .filter(|(outpoint, entry)| {
            !mempool.is_reserved(outpoint)
                && keys.iter().any(|key| key.public == entry.output.pubkey)
        })
        .map(|(_, entry)| entry.output.value)
        .sum()
}

/// Build and sign a payment.
///
/// Coin selection is greedy: UTXOs owned by the given keys are consumed
/// until the payment plus the explicit fee is covered, and the excess comes
/// back as a change output to the first key. Every input is then signed over
/// the finished pre-image by the key that owns the output it spends.
pub fn build_payment(
    keys: &[OwnedKey],
    utxos: &UtxoSet,
    mempool: &Mempool,
    recipient: &PublicKey,
    amount: u64,
    fee: u64,
) -> Result<Transaction> {
    if keys.is_empty() {
        return Err(NodeError::invalid_transaction("no keys to spend with"));
    }
    let total_needed = amount
        .checked_add(fee)
        .ok_or_else(|| NodeError::invalid_transaction("amount overflow"))?;

    // Gather inputs until the target is covered, skipping outputs a pending
    // mempool transaction already reserves
    let mut selected: Vec<(OutPoint, &OwnedKey)> = vec![];
    let mut input_sum: u64 = 0;
    for (outpoint, entry) in utxos.iter() {
        if input_sum >= total_needed {
            break;
        }
        if mempool.is_reserved(outpoint) {
            continue;
        }
        let Some(owner) = keys.iter().find(|key| key.public == entry.output.pubkey) else {
            continue;
        };
        selected.push((*outpoint, owner));
        input_sum += entry.output.value;
    }
    if input_sum < total_needed {
        return Err(NodeError::invalid_transaction("insufficient funds"));
    }

    let mut outputs = vec![TransactionOutput {
        value: amount,
        pubkey: *recipient,
    }];
    if input_sum > total_needed {
        outputs.push(TransactionOutput {
            value: input_sum - total_needed,
            pubkey: keys[0].public,
        });
    }

    // The pre-image covers the final input and output lists, so signing is
    // the last step
    let timestamp = Utc::now();
    let outpoints: Vec<OutPoint> = selected.iter().map(|(outpoint, _)| *outpoint).collect();
    let signing_bytes =
        Transaction::signing_bytes_for(&outpoints, &outputs, fee, timestamp, None)?;

    let inputs = selected
        .into_iter()
        .map(|(outpoint, owner)| TransactionInput {
            prev_output: outpoint,
            signature: Signature::sign(&signing_bytes, &owner.private),
        })
        .collect();

    Ok(Transaction {
        inputs,
        outputs,
        fee,
        timestamp,
        nonce: None,
    })
}
