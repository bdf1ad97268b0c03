use crate::error::{NodeError, Result};
use crate::sha256::Hash;
use crate::util::Saveable;
use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature as ECDSASignature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use serde::{Deserialize, Serialize};
use spki::{DecodePublicKey, EncodePublicKey};
use std::fmt;
use std::io::{
    Error as IoError, ErrorKind as IoErrorKind, Read as IoRead, Result as IoResult, Write as IoWrite,
};

/// Prefix for the human-readable address form.
const ADDRESS_PREFIX: &str = "oxi1";

/// Produce the canonical byte string of a value for signing: JSON with keys
/// sorted lexicographically at every depth and no whitespace between tokens.
/// Sender and verifier must agree on these bytes exactly, so the value is
/// round-tripped through `serde_json::Value`, whose object representation
/// keeps keys sorted.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(value)
        .map_err(|e| NodeError::invalid_transaction(format!("canonical encoding failed: {e}")))?;
    serde_json::to_vec(&value)
        .map_err(|e| NodeError::invalid_transaction(format!("canonical encoding failed: {e}")))
}

/// A secp256k1 ECDSA signature.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Signature(pub ECDSASignature);

impl Signature {
    /// Sign a canonical payload. ECDSA pre-hashes the payload with SHA-256,
    /// so the signature commits to `SHA-256(payload)`.
    pub fn sign(payload: &[u8], private_key: &PrivateKey) -> Self {
        Signature(private_key.0.sign(payload))
    }

    /// Convenience for signing a digest that has already been computed.
    pub fn sign_hash(hash: &Hash, private_key: &PrivateKey) -> Self {
        Self::sign(&hash.as_bytes(), private_key)
    }

    pub fn verify(&self, payload: &[u8], public_key: &PublicKey) -> bool {
        public_key.0.verify(payload, &self.0).is_ok()
    }

    pub fn verify_hash(&self, hash: &Hash, public_key: &PublicKey) -> bool {
        self.verify(&hash.as_bytes(), public_key)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0.to_bytes())
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|_| NodeError::InvalidSignature)?;
        let signature =
            ECDSASignature::from_slice(&bytes).map_err(|_| NodeError::InvalidSignature)?;
        Ok(Signature(signature))
    }
}

/// A secp256k1 public key. Used both as the recipient of transaction outputs
/// and as the identity of a peer on the network.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublicKey(pub VerifyingKey);

impl PublicKey {
    /// Compressed SEC1 form, 33 bytes.
    pub fn sec1_bytes(&self) -> Vec<u8> {
        self.0.to_encoded_point(true).as_bytes().to_vec()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.sec1_bytes())
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| NodeError::InvalidPublicKey {
            reason: format!("bad hex: {e}"),
        })?;
        let key = VerifyingKey::from_sec1_bytes(&bytes).map_err(|e| NodeError::InvalidPublicKey {
            reason: e.to_string(),
        })?;
        Ok(PublicKey(key))
    }

    /// Short identity string: first 16 bytes of SHA-256 over the compressed
    /// key, hex-encoded. This is the `sender_id` carried in envelopes.
    pub fn fingerprint(&self) -> String {
        let digest = Hash::hash_bytes(&self.sec1_bytes());
        hex::encode(&digest.as_bytes()[..16])
    }

    /// Human-readable address form of this key.
    pub fn address(&self) -> Address {
        let digest = Hash::hash_bytes(&self.sec1_bytes());
        Address(format!(
            "{}{}",
            ADDRESS_PREFIX,
            hex::encode(&digest.as_bytes()[..20])
        ))
    }
}

/// Display/API form of a public key: `oxi1` followed by the hex of the first
/// 20 bytes of the key's SHA-256 digest. Outputs still carry the full key so
/// signatures can be checked without an address-to-key lookup.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(String);

impl Address {
    pub fn parse(s: &str) -> Result<Self> {
        let body = s
            .strip_prefix(ADDRESS_PREFIX)
            .ok_or_else(|| NodeError::invalid_hash(format!("address missing prefix: {s}")))?;
        if body.len() != 40 || hex::decode(body).is_err() {
            return Err(NodeError::invalid_hash(format!("malformed address: {s}")));
        }
        Ok(Address(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A secp256k1 private key. Node identity and wallet keys both use this type.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PrivateKey(#[serde(with = "signkey_serde")] pub SigningKey);

impl PrivateKey {
    pub fn new_key() -> Self {
        PrivateKey(SigningKey::random(&mut rand::rngs::OsRng))
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(*self.0.verifying_key())
    }
}

mod signkey_serde {
    use k256::ecdsa::SigningKey;
    use serde::Deserialize;

    pub fn serialize<S>(key: &SigningKey, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_bytes(&key.to_bytes())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SigningKey, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes: Vec<u8> = Vec::<u8>::deserialize(deserializer)?;
        SigningKey::from_slice(&bytes).map_err(serde::de::Error::custom)
    }
}

impl Saveable for PrivateKey {
    fn load<I: IoRead>(mut reader: I) -> IoResult<Self> {
        let mut buf = String::new();
        reader.read_to_string(&mut buf)?;
        let key = SigningKey::from_pkcs8_pem(&buf)
            .map_err(|_| IoError::new(IoErrorKind::InvalidData, "Failed to parse private key PEM"))?;
        Ok(PrivateKey(key))
    }

    fn save<O: IoWrite>(&self, mut writer: O) -> IoResult<()> {
        let pem = self
            .0
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|_| IoError::new(IoErrorKind::InvalidData, "Failed to encode private key PEM"))?;
        writer.write_all(pem.as_bytes())
    }
}

impl Saveable for PublicKey {
    fn load<I: IoRead>(mut reader: I) -> IoResult<Self> {
        let mut buf = String::new();
        reader.read_to_string(&mut buf)?;
        let key = VerifyingKey::from_public_key_pem(&buf)
            .map_err(|_| IoError::new(IoErrorKind::InvalidData, "Failed to parse public key PEM"))?;
        Ok(PublicKey(key))
    }

    fn save<O: IoWrite>(&self, mut writer: O) -> IoResult<()> {
        let pem = self
            .0
            .to_public_key_pem(LineEnding::LF)
            .map_err(|_| IoError::new(IoErrorKind::InvalidData, "Failed to encode public key PEM"))?;
        writer.write_all(pem.as_bytes())
    }
}

#[cfg(test)]
mod tests;
