use crate::sha256::Hash;
use crate::types::Transaction;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Result as IoResult, Write};
use std::path::Path;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct MerkleRoot(Hash);

impl MerkleRoot {
    /// Calculates the Merkle root of a block's transactions.
    ///
    /// Leaf nodes are transaction ids; non-leaf nodes hash the pair of their
    /// children. When a layer has an odd number of nodes the last hash is
    /// duplicated, so sender and verifier always agree on the pairing:
    ///
    /// ```text
    /// For 3 transactions [A, B, C]:
    ///
    ///          ROOT = H(H(AB) || H(CC))
    ///          /                      \
    ///      H(AB)                    H(CC)
    ///      /    \                   /    \
    ///   H(A)   H(B)             H(C)   H(C)
    /// ```
    pub fn calculate(transactions: &[Transaction]) -> MerkleRoot {
        let mut layer: Vec<Hash> = vec![];
        for transaction in transactions {
            layer.push(transaction.hash());
        }

        // Combine pairs of hashes until a single root remains
        while layer.len() > 1 {
            let mut new_layer = vec![];
            for pair in layer.chunks(2) {
                let left = pair[0];
                // If there's an odd number, duplicate the last hash
                let right = pair.get(1).unwrap_or(&pair[0]);
                new_layer.push(Hash::hash(&[left, *right]));
            }
            layer = new_layer;
        }

        MerkleRoot(layer[0])
    }

    pub fn as_hash(&self) -> Hash {
        self.0
    }
}

/// Serialized CBOR length of a value, used for the transaction and block
/// size caps.
pub fn serialized_size<T: Serialize>(value: &T) -> usize {
    let mut buf: Vec<u8> = vec![];
    ciborium::into_writer(value, &mut buf).expect("BUG: failed to serialize for sizing");
    buf.len()
}

pub trait Saveable
where
    Self: Sized,
{
    fn load<I: Read>(reader: I) -> IoResult<Self>;
    fn save<O: Write>(&self, writer: O) -> IoResult<()>;
    fn save_to_file<P: AsRef<Path>>(&self, path: P) -> IoResult<()> {
        let file = File::create(&path)?;
        self.save(file)
    }
    fn load_from_file<P: AsRef<Path>>(path: P) -> IoResult<Self> {
        let file = File::open(&path)?;
        Self::load(file)
    }
}

#[cfg(test)]
mod tests;
