use crate::U256;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A SHA-256 digest, stored as a 256-bit integer so that it can be compared
/// against difficulty targets directly.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash(U256);

impl Hash {
    /// Hash any serializable value over its CBOR encoding.
    pub fn hash<T: serde::Serialize>(data: &T) -> Self {
        let mut serialized: Vec<u8> = vec![];
        if let Err(e) = ciborium::into_writer(data, &mut serialized) {
            panic!("BUG: failed to serialize for hashing: {e}");
        }
        Self::hash_bytes(&serialized)
    }

    /// Hash a raw byte string. Used for signing pre-images, which are already
    /// canonical byte strings rather than structures.
    pub fn hash_bytes(bytes: &[u8]) -> Self {
        let hash = sha256::digest(bytes);
        let hash_bytes = hex::decode(hash).expect("BUG: sha256 crate returned invalid hex");
        Hash(U256::from_big_endian(&hash_bytes))
    }

    /// Proof-of-work check: the block hash must not exceed the target.
    pub fn matches_target(&self, target: U256) -> bool {
        self.0 <= target
    }

    pub fn zero() -> Self {
        Hash(U256::zero())
    }

    pub fn as_bytes(&self) -> [u8; 32] {
        self.0.to_big_endian()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }

    pub fn from_hex(s: &str) -> crate::error::Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| crate::error::NodeError::invalid_hash(format!("bad hex: {e}")))?;
        if bytes.len() != 32 {
            return Err(crate::error::NodeError::invalid_hash(format!(
                "expected 32 bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Hash(U256::from_big_endian(&bytes)))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}
