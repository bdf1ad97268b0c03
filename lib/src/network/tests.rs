use crate::crypto::PrivateKey;
use crate::error::EnvelopeRejection;
use crate::network::{Message, SignedMessage};
use chrono::{Duration, Utc};

fn sealed_ping(identity: &PrivateKey) -> SignedMessage {
    SignedMessage::seal(Message::Ping(7), identity, Utc::now()).unwrap()
}

#[test]
fn test_envelope_round_trip() {
    let identity = PrivateKey::new_key();
    let envelope = sealed_ping(&identity);

    let verified = envelope.verify(Utc::now()).unwrap();
    assert_eq!(verified.sender_id, identity.public_key().fingerprint());
    assert_eq!(verified.nonce.len(), 32);
    assert!(matches!(verified.payload, Message::Ping(7)));
}

#[test]
fn test_envelope_survives_wire_encoding() {
    let identity = PrivateKey::new_key();
    let envelope = sealed_ping(&identity);

    let bytes = envelope.encode().unwrap();
    // Canonical form: top-level keys in lexicographic order, no whitespace
    assert!(bytes.starts_with(br#"{"message":{"nonce":""#));

    let (decoded, recovered) = SignedMessage::decode(&bytes, false).unwrap();
    assert!(!recovered);
    assert!(decoded.verify(Utc::now()).is_ok());
}

#[test]
fn test_tampered_nonce_fails_verification() {
    let identity = PrivateKey::new_key();
    let mut envelope = sealed_ping(&identity);

    // Flip one nonce character to another valid hex digit
    let mut nonce: Vec<u8> = envelope.message.nonce.into_bytes();
    nonce[0] = if nonce[0] == b'0' { b'1' } else { b'0' };
    envelope.message.nonce = String::from_utf8(nonce).unwrap();

    assert_eq!(
        envelope.verify(Utc::now()).map(|_| ()),
        Err(EnvelopeRejection::BadSignature)
    );
}

#[test]
fn test_tampered_payload_fails_verification() {
    let identity = PrivateKey::new_key();
    let mut envelope = sealed_ping(&identity);
    envelope.message.payload = Message::Ping(8);

    assert_eq!(
        envelope.verify(Utc::now()).map(|_| ()),
        Err(EnvelopeRejection::BadSignature)
    );
}

#[test]
fn test_spoofed_sender_id_is_malformed() {
    let identity = PrivateKey::new_key();
    let other = PrivateKey::new_key();
    let mut envelope = sealed_ping(&identity);
    envelope.message.sender_id = other.public_key().fingerprint();

    assert_eq!(
        envelope.verify(Utc::now()).map(|_| ()),
        Err(EnvelopeRejection::Malformed)
    );
}

#[test]
fn test_garbled_signature_is_malformed() {
    let identity = PrivateKey::new_key();
    let mut envelope = sealed_ping(&identity);
    envelope.signature = "not-a-signature".to_string();

    assert_eq!(
        envelope.verify(Utc::now()).map(|_| ()),
        Err(EnvelopeRejection::Malformed)
    );
}

#[test]
fn test_clock_skew_window() {
    let identity = PrivateKey::new_key();
    let skew = crate::config::BlockchainConfig::global().peer.max_clock_skew_secs;

    let envelope = sealed_ping(&identity);
    assert!(envelope
        .clone()
        .verify(Utc::now() + Duration::seconds(skew - 1))
        .is_ok());
    assert_eq!(
        envelope
            .verify(Utc::now() + Duration::seconds(skew + 2))
            .map(|_| ()),
        Err(EnvelopeRejection::StaleTimestamp)
    );
}

#[test]
fn test_trailing_junk_recovery() {
    let identity = PrivateKey::new_key();
    let envelope = sealed_ping(&identity);
    let mut bytes = envelope.encode().unwrap();
    bytes.extend_from_slice(b"{\"junk\": true}");

    // Strict parsing refuses the frame
    assert_eq!(
        SignedMessage::decode(&bytes, false).map(|_| ()),
        Err(EnvelopeRejection::Malformed)
    );
    // The recovery path takes the first balanced object and flags the event
    let (decoded, recovered) = SignedMessage::decode(&bytes, true).unwrap();
    assert!(recovered);
    assert!(decoded.verify(Utc::now()).is_ok());
}

#[test]
fn test_decode_rejects_pure_garbage() {
    assert_eq!(
        SignedMessage::decode(b"\x00\x01\x02", true).map(|_| ()),
        Err(EnvelopeRejection::Malformed)
    );
}

#[tokio::test]
async fn test_framed_send_receive() {
    let identity = PrivateKey::new_key();
    let envelope = sealed_ping(&identity);

    let (mut client, mut server) = tokio::io::duplex(64 * 1024);
    envelope.send_async(&mut client).await.unwrap();

    let (received, recovered) = SignedMessage::receive_async(&mut server, false)
        .await
        .unwrap();
    assert!(!recovered);
    let verified = received.verify(Utc::now()).unwrap();
    assert!(matches!(verified.payload, Message::Ping(7)));
}

#[test]
fn test_content_hash_ignores_envelope_identity() {
    let identity_a = PrivateKey::new_key();
    let identity_b = PrivateKey::new_key();
    let a = SignedMessage::seal(Message::Ping(7), &identity_a, Utc::now()).unwrap();
    let b = SignedMessage::seal(Message::Ping(7), &identity_b, Utc::now()).unwrap();

    // Same payload relayed by different peers dedups to one content id
    assert_eq!(a.message.payload.content_hash(), b.message.payload.content_hash());
}
