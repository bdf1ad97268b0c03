use crate::config::BlockchainConfig;
use crate::error::EnvelopeRejection;
use crate::network::{HelloInfo, MessageKind};
use crate::peer::{GoodBehaviour, Misbehaviour, PeerManager, PeerState, TokenBucket};
use crate::sha256::Hash;
use crate::U256;
use chrono::{Duration, Utc};

fn hello(node_id: &str) -> HelloInfo {
    let config = BlockchainConfig::global();
    HelloInfo {
        node_id: node_id.to_string(),
        listen_port: 9000,
        protocol_version: config.peer.protocol_version,
        network_id: config.network.network_id.clone(),
        genesis: None,
        tip_height: 0,
        tip_hash: None,
        best_work: U256::zero(),
    }
}

#[test]
fn test_token_bucket_exhausts_and_refills() {
    let now = Utc::now();
    let mut bucket = TokenBucket::new(2.0, 1.0, now);

    assert!(bucket.try_consume(now));
    assert!(bucket.try_consume(now));
    assert!(!bucket.try_consume(now));
    // One second refills one token
    assert!(bucket.try_consume(now + Duration::seconds(1)));
}

#[test]
fn test_register_and_lifecycle() {
    let now = Utc::now();
    let mut manager = PeerManager::new(now);

    manager.register("peer-1", "127.0.0.1:9001", None, now);
    assert_eq!(manager.get("peer-1").unwrap().state, PeerState::Handshaking);

    manager.mark_connected("peer-1");
    assert_eq!(manager.get("peer-1").unwrap().state, PeerState::Connected);
    assert_eq!(manager.connected().count(), 1);

    manager.disconnect("peer-1");
    assert_eq!(manager.get("peer-1").unwrap().state, PeerState::Unconnected);
}

#[test]
fn test_replayed_nonce_is_rejected_and_penalized() {
    let now = Utc::now();
    let mut manager = PeerManager::new(now);
    manager.register("peer-1", "127.0.0.1:9001", None, now);

    assert!(manager
        .admit_envelope("peer-1", "aa00", MessageKind::Ping, false, now)
        .is_ok());
    assert_eq!(
        manager.admit_envelope("peer-1", "aa00", MessageKind::Ping, false, now),
        Err(EnvelopeRejection::ReplayedNonce)
    );
    assert!(manager.get("peer-1").unwrap().reputation < 0);
}

#[test]
fn test_per_kind_rate_limit() {
    let now = Utc::now();
    let mut manager = PeerManager::new(now);
    manager.register("peer-1", "127.0.0.1:9001", None, now);

    let capacity = BlockchainConfig::global().peer.bucket_capacity as usize;
    for i in 0..capacity {
        assert!(manager
            .admit_envelope("peer-1", &format!("nonce-{i}"), MessageKind::Tx, false, now)
            .is_ok());
    }
    assert_eq!(
        manager.admit_envelope("peer-1", "nonce-last", MessageKind::Tx, false, now),
        Err(EnvelopeRejection::RateLimited)
    );
    // Other message kinds have their own bucket
    assert!(manager
        .admit_envelope("peer-1", "nonce-ping", MessageKind::Ping, false, now)
        .is_ok());
}

#[test]
fn test_reputation_ban_and_cooloff() {
    let now = Utc::now();
    let config = BlockchainConfig::global();
    let mut manager = PeerManager::new(now);
    manager.register("peer-1", "127.0.0.1:9001", None, now);

    // Three invalid blocks cross the default ban threshold
    manager.punish("peer-1", Misbehaviour::InvalidBlock, now);
    manager.punish("peer-1", Misbehaviour::InvalidBlock, now);
    assert_ne!(manager.get("peer-1").unwrap().state, PeerState::Banned);
    manager.punish("peer-1", Misbehaviour::InvalidBlock, now);
    assert_eq!(manager.get("peer-1").unwrap().state, PeerState::Banned);
    assert!(manager.is_banned("peer-1", now));

    // Still banned inside the cool-off, released after it
    let almost = now + Duration::seconds(config.peer.unban_after_secs - 1);
    assert!(manager.is_banned("peer-1", almost));
    let after = now + Duration::seconds(config.peer.unban_after_secs + 1);
    assert!(!manager.is_banned("peer-1", after));
    // Released on probation, not at full trust
    assert_eq!(
        manager.get("peer-1").unwrap().reputation,
        config.peer.warn_threshold
    );
}

#[test]
fn test_reward_is_clamped() {
    let now = Utc::now();
    let config = BlockchainConfig::global();
    let mut manager = PeerManager::new(now);
    manager.register("peer-1", "127.0.0.1:9001", None, now);

    for _ in 0..1000 {
        manager.reward("peer-1", GoodBehaviour::FirstBlockRelay);
    }
    assert_eq!(
        manager.get("peer-1").unwrap().reputation,
        config.peer.reputation_bound
    );
}

#[test]
fn test_validate_hello_refuses_incompatibilities() {
    let now = Utc::now();
    let mut manager = PeerManager::new(now);

    assert!(manager.validate_hello(&hello("peer-1"), None, now).is_ok());

    let mut wrong_version = hello("peer-2");
    wrong_version.protocol_version += 1;
    assert!(manager.validate_hello(&wrong_version, None, now).is_err());

    let mut wrong_network = hello("peer-3");
    wrong_network.network_id = "othernet".to_string();
    assert!(manager.validate_hello(&wrong_network, None, now).is_err());

    let mut wrong_genesis = hello("peer-4");
    wrong_genesis.genesis = Some(Hash::hash(&"theirs"));
    assert!(manager
        .validate_hello(&wrong_genesis, Some(Hash::hash(&"ours")), now)
        .is_err());
    // Genesis only matters once both sides have one
    assert!(manager
        .validate_hello(&wrong_genesis, None, now)
        .is_ok());
}

#[test]
fn test_relay_dedup_by_content() {
    let now = Utc::now();
    let mut manager = PeerManager::new(now);
    let content = Hash::hash(&"block payload");

    assert!(manager.should_relay(MessageKind::Block, content, now));
    assert!(!manager.should_relay(MessageKind::Block, content, now));
    // The same bytes under a different kind are a different relay decision
    assert!(manager.should_relay(MessageKind::Tx, content, now));
}

#[test]
fn test_mark_sent_once_per_peer_per_session() {
    let now = Utc::now();
    let mut manager = PeerManager::new(now);
    manager.register("peer-1", "127.0.0.1:9001", None, now);
    let content = Hash::hash(&"tx payload");

    assert!(manager.mark_sent("peer-1", content));
    assert!(!manager.mark_sent("peer-1", content));

    // A new session starts clean
    manager.disconnect("peer-1");
    assert!(manager.mark_sent("peer-1", content));
}

#[test]
fn test_reputation_decays_toward_zero() {
    let now = Utc::now();
    let mut manager = PeerManager::new(now);
    manager.register("peer-1", "127.0.0.1:9001", None, now);
    manager.register("peer-2", "127.0.0.1:9002", None, now);

    // Negative scores heal one step per maintenance tick
    manager.punish("peer-1", Misbehaviour::StaleTimestamp, now);
    assert_eq!(manager.get("peer-1").unwrap().reputation, -2);
    manager.prune(now);
    assert_eq!(manager.get("peer-1").unwrap().reputation, -1);
    manager.prune(now);
    manager.prune(now);
    // Zero is the resting point, not overshot
    assert_eq!(manager.get("peer-1").unwrap().reputation, 0);

    // Hoarded credit drains the same way
    manager.reward("peer-2", GoodBehaviour::FirstBlockRelay);
    assert_eq!(manager.get("peer-2").unwrap().reputation, 5);
    manager.prune(now);
    assert_eq!(manager.get("peer-2").unwrap().reputation, 4);
}

#[test]
fn test_banned_peer_reputation_does_not_decay() {
    let now = Utc::now();
    let mut manager = PeerManager::new(now);
    manager.register("peer-1", "127.0.0.1:9001", None, now);

    manager.punish("peer-1", Misbehaviour::OverdeepReorg, now);
    assert_eq!(manager.get("peer-1").unwrap().state, PeerState::Banned);
    let banned_score = manager.get("peer-1").unwrap().reputation;

    // Inside the cool-off the score is frozen; release goes through the
    // probation reset, not the decay path
    manager.prune(now);
    assert_eq!(manager.get("peer-1").unwrap().reputation, banned_score);
}

#[test]
fn test_prune_expires_nonce_window() {
    let now = Utc::now();
    let config = BlockchainConfig::global();
    let mut manager = PeerManager::new(now);
    manager.register("peer-1", "127.0.0.1:9001", None, now);

    manager
        .admit_envelope("peer-1", "bb11", MessageKind::Ping, false, now)
        .unwrap();
    let later = now + Duration::seconds(config.peer.nonce_window_secs + 1);
    manager.prune(later);
    // Outside the recency window the nonce may be seen again
    assert!(manager
        .admit_envelope("peer-1", "bb11", MessageKind::Ping, false, later)
        .is_ok());
}
