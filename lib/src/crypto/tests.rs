use crate::crypto::{canonical_bytes, Address, PrivateKey, Signature};
use crate::util::Saveable;

#[test]
fn test_key_generation() {
    let private_key = PrivateKey::new_key();
    let public_key = private_key.public_key();

    // Keys should be generated successfully
    assert_ne!(private_key.0.to_bytes().len(), 0);

    // Public key should be derivable from private key
    let public_key2 = private_key.public_key();
    assert_eq!(public_key, public_key2);
}

#[test]
fn test_signature_round_trip() {
    let private_key = PrivateKey::new_key();
    let public_key = private_key.public_key();

    let payload = b"test message";
    let signature = Signature::sign(payload, &private_key);

    assert!(signature.verify(payload, &public_key));
}

#[test]
fn test_signature_fails_wrong_message() {
    let private_key = PrivateKey::new_key();
    let public_key = private_key.public_key();

    let signature = Signature::sign(b"message 1", &private_key);

    assert!(!signature.verify(b"message 2", &public_key));
}

#[test]
fn test_signature_fails_wrong_key() {
    let private_key1 = PrivateKey::new_key();
    let private_key2 = PrivateKey::new_key();

    let signature = Signature::sign(b"test message", &private_key1);

    assert!(!signature.verify(b"test message", &private_key2.public_key()));
}

#[test]
fn test_signature_fails_single_bit_flip() {
    let private_key = PrivateKey::new_key();
    let public_key = private_key.public_key();

    let payload = b"the quick brown fox".to_vec();
    let signature = Signature::sign(&payload, &private_key);

    for bit in 0..8 {
        let mut tampered = payload.clone();
        tampered[0] ^= 1 << bit;
        assert!(!signature.verify(&tampered, &public_key));
    }
}

#[test]
fn test_signature_hex_round_trip() {
    let private_key = PrivateKey::new_key();
    let signature = Signature::sign(b"payload", &private_key);

    let restored = Signature::from_hex(&signature.to_hex()).unwrap();
    assert_eq!(restored, signature);
    assert!(restored.verify(b"payload", &private_key.public_key()));
}

#[test]
fn test_public_key_hex_round_trip() {
    let public_key = PrivateKey::new_key().public_key();
    let restored = crate::crypto::PublicKey::from_hex(&public_key.to_hex()).unwrap();
    assert_eq!(restored, public_key);
}

#[test]
fn test_fingerprint_is_stable_and_short() {
    let public_key = PrivateKey::new_key().public_key();
    let fp = public_key.fingerprint();
    assert_eq!(fp.len(), 32);
    assert_eq!(fp, public_key.fingerprint());
}

#[test]
fn test_address_encoding() {
    let public_key = PrivateKey::new_key().public_key();
    let address = public_key.address();

    assert!(address.as_str().starts_with("oxi1"));
    assert_eq!(Address::parse(address.as_str()).unwrap(), address);
    assert!(Address::parse("oxi1nothex").is_err());
    assert!(Address::parse("1234").is_err());
}

#[test]
fn test_canonical_bytes_sorted_and_compact() {
    #[derive(serde::Serialize)]
    struct Unordered {
        zebra: u32,
        apple: u32,
    }

    let bytes = canonical_bytes(&Unordered { zebra: 1, apple: 2 }).unwrap();
    assert_eq!(bytes, br#"{"apple":2,"zebra":1}"#.to_vec());
}

#[test]
fn test_private_key_pem_round_trip() {
    let key = PrivateKey::new_key();

    let mut pem: Vec<u8> = vec![];
    key.save(&mut pem).unwrap();
    let restored = PrivateKey::load(&pem[..]).unwrap();

    assert_eq!(restored.public_key(), key.public_key());
}

#[test]
fn test_public_key_pem_round_trip() {
    let public_key = PrivateKey::new_key().public_key();

    let mut pem: Vec<u8> = vec![];
    public_key.save(&mut pem).unwrap();
    let restored = crate::crypto::PublicKey::load(&pem[..]).unwrap();

    assert_eq!(restored, public_key);
}
