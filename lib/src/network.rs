//! Inter-node message protocol.
//!
//! Every message travels inside a signed envelope:
//!
//! ```text
//! { "message": { "nonce": "...32 hex...",
//!                "payload": { ... },
//!                "sender_id": "<pubkey fingerprint>",
//!                "timestamp": 1700000000 },
//!   "signature": "<pubkey_hex>.<sig_hex>" }
//! ```
//!
//! The signature is secp256k1 over SHA-256 of the canonical serialization of
//! the `message` object: JSON with keys sorted lexicographically at every
//! depth and no whitespace between tokens. A verifier rejects malformed
//! structure, a bad signature, or a timestamp outside the clock-skew window;
//! nonce replay is tracked per sender by the peer manager.

use crate::crypto::{canonical_bytes, PrivateKey, PublicKey, Signature};
use crate::error::{EnvelopeRejection, NodeError, Result};
use crate::sha256::Hash;
use crate::types::{Block, BlockHeader, OutPoint, Transaction, TransactionOutput};
use crate::U256;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames larger than this are dropped before parsing.
const MAX_FRAME_BYTES: usize = 4 * crate::MAX_BLOCK_SIZE;

/// Identity information exchanged during the handshake.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct HelloInfo {
    pub node_id: String,
    pub listen_port: u16,
    pub protocol_version: u32,
    pub network_id: String,
    pub genesis: Option<Hash>,
    pub tip_height: u64,
    pub tip_hash: Option<Hash>,
    /// Cumulative work of the sender's best chain.
    pub best_work: U256,
}

/// Everything a node can say to another node. Adding a kind forces every
/// receiver match to make a decision at compile time.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "kind", content = "data")]
pub enum Message {
    /// Identity + tip exchange; first message in both directions.
    Hello(HelloInfo),
    /// Relay a single transaction.
    Tx(Transaction),
    /// Relay a single block.
    Block(Block),
    /// Accept/reject acknowledgement for a relayed block.
    BlockAck {
        hash: Hash,
        accepted: bool,
        reason: Option<String>,
    },
    /// Request headers following the first locator hash the receiver knows.
    GetHeaders {
        locator: Vec<Hash>,
        max: u32,
        request_id: u64,
    },
    Headers {
        headers: Vec<BlockHeader>,
        request_id: u64,
    },
    /// Request one block body by hash.
    GetBlock { hash: Hash, request_id: u64 },
    Ping(u64),
    Pong(u64),
    /// Peer discovery.
    DiscoverNodes,
    NodeList(Vec<String>),
    /// Miner-facing template flow.
    FetchTemplate(PublicKey),
    Template(Block),
    ValidateTemplate(Block),
    TemplateValidity(bool),
    SubmitTemplate(Block),
    /// Wallet-facing UTXO queries; the bool flags outputs reserved by a
    /// pending mempool spend.
    FetchUtxos(PublicKey),
    Utxos(Vec<(OutPoint, TransactionOutput, bool)>),
}

/// Rate-limit classes. `Recovery` is the pseudo-kind charged when a frame
/// needed the trailing-junk recovery path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Hello,
    Tx,
    Block,
    BlockAck,
    GetHeaders,
    Headers,
    GetBlock,
    Ping,
    Discover,
    Template,
    Utxo,
    Recovery,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Hello(_) => MessageKind::Hello,
            Message::Tx(_) => MessageKind::Tx,
            Message::Block(_) => MessageKind::Block,
            Message::BlockAck { .. } => MessageKind::BlockAck,
            Message::GetHeaders { .. } => MessageKind::GetHeaders,
            Message::Headers { .. } => MessageKind::Headers,
            Message::GetBlock { .. } => MessageKind::GetBlock,
            Message::Ping(_) | Message::Pong(_) => MessageKind::Ping,
            Message::DiscoverNodes | Message::NodeList(_) => MessageKind::Discover,
            Message::FetchTemplate(_)
            | Message::Template(_)
            | Message::ValidateTemplate(_)
            | Message::TemplateValidity(_)
            | Message::SubmitTemplate(_) => MessageKind::Template,
            Message::FetchUtxos(_) | Message::Utxos(_) => MessageKind::Utxo,
        }
    }

    /// Content identity for broadcast dedup: the hash of the canonical
    /// payload encoding, independent of envelope nonce and timestamp.
    pub fn content_hash(&self) -> Hash {
        match canonical_bytes(self) {
            Ok(bytes) => Hash::hash_bytes(&bytes),
            Err(_) => Hash::zero(),
        }
    }
}

/// The signed inner object of an envelope.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct EnvelopeBody {
    pub payload: Message,
    /// Unix seconds.
    pub timestamp: i64,
    /// 32 hex chars from 16 random bytes.
    pub nonce: String,
    /// Fingerprint of the sender's public key.
    pub sender_id: String,
}

/// A complete wire message: inner object plus detached signature.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SignedMessage {
    pub message: EnvelopeBody,
    /// `pubkey_hex + "." + sig_hex`
    pub signature: String,
}

/// The outcome of envelope verification: who spoke, and what they said.
#[derive(Clone, Debug)]
pub struct VerifiedEnvelope {
    pub sender: PublicKey,
    pub sender_id: String,
    pub nonce: String,
    pub timestamp: i64,
    pub payload: Message,
}

impl SignedMessage {
    /// Wrap and sign a payload with this node's identity key.
    pub fn seal(payload: Message, identity: &PrivateKey, now: DateTime<Utc>) -> Result<Self> {
        let nonce: [u8; 16] = rand::random();
        let message = EnvelopeBody {
            payload,
            timestamp: now.timestamp(),
            nonce: hex::encode(nonce),
            sender_id: identity.public_key().fingerprint(),
        };
        let bytes = canonical_bytes(&message)?;
        let signature = Signature::sign(&bytes, identity);
        Ok(SignedMessage {
            message,
            signature: format!("{}.{}", identity.public_key().to_hex(), signature.to_hex()),
        })
    }

    /// Check structure, signature and clock skew. Nonce replay is stateful
    /// and belongs to the peer manager, which also owns the penalty.
    pub fn verify(self, now: DateTime<Utc>) -> std::result::Result<VerifiedEnvelope, EnvelopeRejection> {
        let (pubkey_hex, sig_hex) = self
            .signature
            .split_once('.')
            .ok_or(EnvelopeRejection::Malformed)?;
        let sender = PublicKey::from_hex(pubkey_hex).map_err(|_| EnvelopeRejection::Malformed)?;
        let signature = Signature::from_hex(sig_hex).map_err(|_| EnvelopeRejection::Malformed)?;

        // The claimed identity must be the fingerprint of the signing key
        if self.message.sender_id != sender.fingerprint() {
            return Err(EnvelopeRejection::Malformed);
        }
        if self.message.nonce.len() != 32 || hex::decode(&self.message.nonce).is_err() {
            return Err(EnvelopeRejection::Malformed);
        }

        let bytes = canonical_bytes(&self.message).map_err(|_| EnvelopeRejection::Malformed)?;
        if !signature.verify(&bytes, &sender) {
            return Err(EnvelopeRejection::BadSignature);
        }

        let skew = (now.timestamp() - self.message.timestamp).abs();
        if skew > crate::config::BlockchainConfig::global().peer.max_clock_skew_secs {
            return Err(EnvelopeRejection::StaleTimestamp);
        }

        Ok(VerifiedEnvelope {
            sender,
            sender_id: self.message.sender_id,
            nonce: self.message.nonce,
            timestamp: self.message.timestamp,
            payload: self.message.payload,
        })
    }

    /// Canonical wire bytes of the whole envelope.
    pub fn encode(&self) -> Result<Vec<u8>> {
        canonical_bytes(self)
    }

    /// Parse an envelope from raw bytes. When `allow_recovery` is set and
    /// the first balanced JSON object ends before the end of the buffer,
    /// the remainder is discarded and the parse still succeeds; the returned
    /// flag tells the caller to log and rate-limit the event, since trailing
    /// junk usually indicates a framing bug or an attack.
    pub fn decode(
        bytes: &[u8],
        allow_recovery: bool,
    ) -> std::result::Result<(Self, bool), EnvelopeRejection> {
        let mut stream = serde_json::Deserializer::from_slice(bytes).into_iter::<SignedMessage>();
        let envelope = match stream.next() {
            Some(Ok(envelope)) => envelope,
            _ => return Err(EnvelopeRejection::Malformed),
        };
        let consumed = stream.byte_offset();
        let trailing = bytes[consumed..].iter().any(|b| !b.is_ascii_whitespace());
        if trailing && !allow_recovery {
            return Err(EnvelopeRejection::Malformed);
        }
        Ok((envelope, trailing))
    }

    /// Write this envelope to a stream as a length-prefixed frame.
    pub async fn send_async<W: AsyncWrite + Unpin>(&self, stream: &mut W) -> Result<()> {
        let bytes = self.encode()?;
        if bytes.len() > MAX_FRAME_BYTES {
            return Err(NodeError::network("outbound frame exceeds the size cap"));
        }
        stream
            .write_u32(bytes.len() as u32)
            .await
            .map_err(|e| NodeError::network(format!("write frame length: {e}")))?;
        stream
            .write_all(&bytes)
            .await
            .map_err(|e| NodeError::network(format!("write frame: {e}")))?;
        stream
            .flush()
            .await
            .map_err(|e| NodeError::network(format!("flush frame: {e}")))?;
        Ok(())
    }

    /// Read one length-prefixed frame and parse it. The returned flag marks
    /// a frame that needed trailing-junk recovery.
    pub async fn receive_async<R: AsyncRead + Unpin>(
        stream: &mut R,
        allow_recovery: bool,
    ) -> Result<(Self, bool)> {
        let len = stream
            .read_u32()
            .await
            .map_err(|e| NodeError::network(format!("read frame length: {e}")))? as usize;
        if len > MAX_FRAME_BYTES {
            return Err(NodeError::network("inbound frame exceeds the size cap"));
        }
        let mut bytes = vec![0u8; len];
        stream
            .read_exact(&mut bytes)
            .await
            .map_err(|e| NodeError::network(format!("read frame: {e}")))?;
        Self::decode(&bytes, allow_recovery).map_err(NodeError::from)
    }
}

#[cfg(test)]
mod tests;
