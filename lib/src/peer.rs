//! Peer lifecycle, reputation and rate limiting.
//!
//! Every peer is tracked by node id (public-key fingerprint). Reputation
//! starts at zero, misbehaviour subtracts, useful behaviour adds; crossing
//! the ban threshold flips the peer to `Banned` for a configured cool-off.
//! Rate limiting is token-bucket per peer per message kind with one
//! aggregate ingress bucket protecting the node as a whole.

use crate::config::BlockchainConfig;
use crate::crypto::PublicKey;
use crate::error::EnvelopeRejection;
use crate::network::{HelloInfo, MessageKind};
use crate::sha256::Hash;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerState {
    Unconnected,
    Handshaking,
    Connected,
    Banned,
}

/// Why a handshake was refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeRefusal {
    #[error("protocol version {theirs} incompatible with ours {ours}")]
    Version { ours: u32, theirs: u32 },
    #[error("network id {0:?} does not match ours")]
    Network(String),
    #[error("peer follows a different genesis")]
    Genesis,
    #[error("peer is banned")]
    Banned,
}

/// Events that cost a peer reputation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Misbehaviour {
    BadSignature,
    StaleTimestamp,
    ReplayedNonce,
    RateLimit,
    InvalidBlock,
    InvalidTransaction,
    OverdeepReorg,
    RequestTimeout,
}

impl Misbehaviour {
    fn penalty(self) -> i32 {
        match self {
            Misbehaviour::BadSignature => 10,
            Misbehaviour::StaleTimestamp => 2,
            Misbehaviour::ReplayedNonce => 5,
            Misbehaviour::RateLimit => 2,
            Misbehaviour::InvalidBlock => 20,
            Misbehaviour::InvalidTransaction => 5,
            Misbehaviour::OverdeepReorg => 50,
            Misbehaviour::RequestTimeout => 3,
        }
    }
}

/// Events that earn a peer reputation back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GoodBehaviour {
    /// First peer to relay a block we went on to accept.
    FirstBlockRelay,
    /// Served a header range that advanced our sync.
    UsefulHeaders,
}

impl GoodBehaviour {
    fn credit(self) -> i32 {
        match self {
            GoodBehaviour::FirstBlockRelay => 5,
            GoodBehaviour::UsefulHeaders => 1,
        }
    }
}

/// Classic token bucket; refill is computed lazily from the elapsed time.
#[derive(Clone, Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: DateTime<Utc>,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_per_sec: f64, now: DateTime<Utc>) -> Self {
        TokenBucket {
            capacity,
            tokens: capacity,
            refill_per_sec,
            last_refill: now,
        }
    }

    pub fn try_consume(&mut self, now: DateTime<Utc>) -> bool {
        let elapsed = (now - self.last_refill).num_milliseconds().max(0) as f64 / 1000.0;
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[derive(Clone, Debug)]
pub struct PeerRecord {
    pub node_id: String,
    pub address: String,
    pub pubkey: Option<PublicKey>,
    pub last_seen: DateTime<Utc>,
    pub reputation: i32,
    pub state: PeerState,
    banned_until: Option<DateTime<Utc>>,
    buckets: HashMap<MessageKind, TokenBucket>,
    /// Content hashes already sent to this peer this session.
    sent: HashSet<Hash>,
}

impl PeerRecord {
    fn new(node_id: String, address: String, pubkey: Option<PublicKey>, now: DateTime<Utc>) -> Self {
        PeerRecord {
            node_id,
            address,
            pubkey,
            last_seen: now,
            reputation: 0,
            state: PeerState::Unconnected,
            banned_until: None,
            buckets: HashMap::new(),
            sent: HashSet::new(),
        }
    }

    fn bucket(&mut self, kind: MessageKind, now: DateTime<Utc>) -> &mut TokenBucket {
        let config = &BlockchainConfig::global().peer;
        self.buckets.entry(kind).or_insert_with(|| {
            TokenBucket::new(config.bucket_capacity, config.bucket_refill_per_sec, now)
        })
    }
}

pub struct PeerManager {
    peers: HashMap<String, PeerRecord>,
    /// (sender_id, nonce) pairs seen inside the recency window.
    nonce_cache: HashMap<(String, String), DateTime<Utc>>,
    /// (kind, content hash) pairs recently relayed, to suppress gossip loops.
    seen_content: HashMap<Hash, DateTime<Utc>>,
    ingress: TokenBucket,
}

impl PeerManager {
    pub fn new(now: DateTime<Utc>) -> Self {
        let config = &BlockchainConfig::global().peer;
        PeerManager {
            peers: HashMap::new(),
            nonce_cache: HashMap::new(),
            seen_content: HashMap::new(),
            ingress: TokenBucket::new(config.ingress_capacity, config.ingress_refill_per_sec, now),
        }
    }

    pub fn get(&self, node_id: &str) -> Option<&PeerRecord> {
        self.peers.get(node_id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn connected(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers
            .values()
            .filter(|peer| peer.state == PeerState::Connected)
    }

    /// Start tracking a peer at the handshake stage. Re-registering an
    /// existing peer refreshes its address but keeps its reputation.
    pub fn register(
        &mut self,
        node_id: &str,
        address: &str,
        pubkey: Option<PublicKey>,
        now: DateTime<Utc>,
    ) -> &mut PeerRecord {
        let record = self
            .peers
            .entry(node_id.to_string())
            .or_insert_with(|| PeerRecord::new(node_id.to_string(), address.to_string(), pubkey, now));
        record.address = address.to_string();
        if pubkey.is_some() {
            record.pubkey = pubkey;
        }
        record.last_seen = now;
        if record.state == PeerState::Unconnected {
            record.state = PeerState::Handshaking;
        }
        record
    }

    pub fn mark_connected(&mut self, node_id: &str) {
        if let Some(peer) = self.peers.get_mut(node_id) {
            if peer.state == PeerState::Handshaking {
                peer.state = PeerState::Connected;
            }
        }
    }

    /// A session ended; per-session broadcast state resets but reputation
    /// survives for the next dial.
    pub fn disconnect(&mut self, node_id: &str) {
        if let Some(peer) = self.peers.get_mut(node_id) {
            if peer.state != PeerState::Banned {
                peer.state = PeerState::Unconnected;
            }
            peer.sent.clear();
        }
    }

    /// Banned peers are refused before the handshake; the ban lapses after
    /// the configured cool-off.
    pub fn is_banned(&mut self, node_id: &str, now: DateTime<Utc>) -> bool {
        let unbanned = match self.peers.get_mut(node_id) {
            Some(peer) if peer.state == PeerState::Banned => match peer.banned_until {
                Some(until) if now >= until => {
                    peer.state = PeerState::Unconnected;
                    peer.banned_until = None;
                    // Leave the peer on probation rather than at full trust
                    peer.reputation = BlockchainConfig::global().peer.warn_threshold;
                    true
                }
                _ => return true,
            },
            _ => return false,
        };
        if unbanned {
            info!(peer = node_id, "ban cool-off elapsed, peer unbanned");
        }
        false
    }

    /// Compatibility check on an incoming `Hello`.
    pub fn validate_hello(
        &mut self,
        hello: &HelloInfo,
        our_genesis: Option<Hash>,
        now: DateTime<Utc>,
    ) -> Result<(), HandshakeRefusal> {
        let config = BlockchainConfig::global();
        if self.is_banned(&hello.node_id, now) {
            return Err(HandshakeRefusal::Banned);
        }
        if hello.protocol_version != config.peer.protocol_version {
            return Err(HandshakeRefusal::Version {
                ours: config.peer.protocol_version,
                theirs: hello.protocol_version,
            });
        }
        if hello.network_id != config.network.network_id {
            return Err(HandshakeRefusal::Network(hello.network_id.clone()));
        }
        // Two non-empty chains must share a genesis
        if let (Some(ours), Some(theirs)) = (our_genesis, hello.genesis) {
            if ours != theirs {
                return Err(HandshakeRefusal::Genesis);
            }
        }
        Ok(())
    }

    /// Gatekeeper for a verified envelope: aggregate ingress bucket, the
    /// per-peer per-kind bucket, nonce replay, and the recovery-path budget.
    /// Violations are penalized here and reported to the caller for drop.
    pub fn admit_envelope(
        &mut self,
        sender_id: &str,
        nonce: &str,
        kind: MessageKind,
        recovered: bool,
        now: DateTime<Utc>,
    ) -> Result<(), EnvelopeRejection> {
        if !self.ingress.try_consume(now) {
            self.punish(sender_id, Misbehaviour::RateLimit, now);
            return Err(EnvelopeRejection::RateLimited);
        }

        let Some(peer) = self.peers.get_mut(sender_id) else {
            return Err(EnvelopeRejection::RateLimited);
        };
        if peer.state == PeerState::Banned {
            return Err(EnvelopeRejection::RateLimited);
        }
        peer.last_seen = now;
        if !peer.bucket(kind, now).try_consume(now) {
            self.punish(sender_id, Misbehaviour::RateLimit, now);
            return Err(EnvelopeRejection::RateLimited);
        }
        if recovered && !peer_bucket(self, sender_id, MessageKind::Recovery, now) {
            self.punish(sender_id, Misbehaviour::RateLimit, now);
            return Err(EnvelopeRejection::RateLimited);
        }

        let key = (sender_id.to_string(), nonce.to_string());
        if self.nonce_cache.contains_key(&key) {
            self.punish(sender_id, Misbehaviour::ReplayedNonce, now);
            return Err(EnvelopeRejection::ReplayedNonce);
        }
        self.nonce_cache.insert(key, now);
        Ok(())
    }

    /// Subtract reputation; crossing the ban threshold bans the peer.
    pub fn punish(&mut self, node_id: &str, offence: Misbehaviour, now: DateTime<Utc>) {
        let config = &BlockchainConfig::global().peer;
        let Some(peer) = self.peers.get_mut(node_id) else {
            return;
        };
        peer.reputation = (peer.reputation - offence.penalty()).max(-config.reputation_bound);
        if peer.reputation <= config.warn_threshold && peer.reputation > config.ban_threshold {
            warn!(peer = node_id, reputation = peer.reputation, ?offence, "peer approaching ban threshold");
        }
        if peer.reputation <= config.ban_threshold && peer.state != PeerState::Banned {
            peer.state = PeerState::Banned;
            peer.banned_until = Some(now + Duration::seconds(config.unban_after_secs));
            warn!(peer = node_id, reputation = peer.reputation, "peer banned");
        }
    }

    pub fn reward(&mut self, node_id: &str, credit: GoodBehaviour) {
        let config = &BlockchainConfig::global().peer;
        if let Some(peer) = self.peers.get_mut(node_id) {
            peer.reputation = (peer.reputation + credit.credit()).min(config.reputation_bound);
        }
    }

    /// Whether this content should be relayed at all: the first sighting
    /// wins, later duplicates are suppressed.
    pub fn should_relay(&mut self, kind: MessageKind, content: Hash, now: DateTime<Utc>) -> bool {
        let key = Hash::hash(&(format!("{kind:?}"), content));
        match self.seen_content.get(&key) {
            Some(_) => false,
            None => {
                self.seen_content.insert(key, now);
                true
            }
        }
    }

    /// Outbound dedup: record that `content` went to `node_id` this session.
    /// Returns false when it was already sent.
    pub fn mark_sent(&mut self, node_id: &str, content: Hash) -> bool {
        match self.peers.get_mut(node_id) {
            Some(peer) => peer.sent.insert(content),
            None => true,
        }
    }

    /// Periodic maintenance: expire nonce-cache and relay-dedup entries,
    /// decay reputation one step toward zero, and lift lapsed bans.
    /// The decay slowly forgives old offences and trims hoarded credit, so
    /// a peer's score reflects recent behaviour rather than ancient history.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let config = &BlockchainConfig::global().peer;
        let nonce_window = Duration::seconds(config.nonce_window_secs);
        self.nonce_cache.retain(|_, seen| now - *seen <= nonce_window);
        self.seen_content.retain(|_, seen| now - *seen <= nonce_window);
        for peer in self.peers.values_mut() {
            if peer.state != PeerState::Banned {
                peer.reputation -= peer.reputation.signum();
            }
        }
        let ids: Vec<String> = self.peers.keys().cloned().collect();
        for id in ids {
            self.is_banned(&id, now);
        }
    }
}

// Free helper so `admit_envelope` can touch a second bucket without holding
// the first mutable borrow.
fn peer_bucket(manager: &mut PeerManager, node_id: &str, kind: MessageKind, now: DateTime<Utc>) -> bool {
    match manager.peers.get_mut(node_id) {
        Some(peer) => peer.bucket(kind, now).try_consume(now),
        None => false,
    }
}

#[cfg(test)]
mod tests;
