// Integration tests for the ChannelTrust crypto layer.

use bytes::BytesMut;

use channeltrust::crypto::cipher::{
    session_ciphers, FrameOpener, FrameSealer, BLOCK_SIZE, FLAG_CLOSE_CHANNEL, FLAG_DATA,
    MAC_SIZE,
};
use channeltrust::crypto::kdf::{
    derive_iv, derive_master_key, psk_tag, random_nonce, verify_psk_tag, MasterKey,
    PreSharedKey,
};
use channeltrust::crypto::key_agreement::{EphemeralKeyPair, KeyAgreementAlgorithm};
use channeltrust::crypto::keys::{verify_signature, IdentityKeyPair};
use channeltrust::TrustError;

fn client_server_ciphers() -> ((FrameSealer, FrameOpener), (FrameSealer, FrameOpener)) {
    let client_nonce = random_nonce();
    let server_nonce = random_nonce();
    let client_eph = EphemeralKeyPair::generate(KeyAgreementAlgorithm::EcdheX25519).unwrap();
    let server_eph = EphemeralKeyPair::generate(KeyAgreementAlgorithm::EcdheX25519).unwrap();

    let client_key = derive_master_key(
        &client_eph.agree(server_eph.public_key_bytes()).unwrap(),
        &server_nonce,
        &client_nonce,
    );
    let server_key = derive_master_key(
        &server_eph.agree(client_eph.public_key_bytes()).unwrap(),
        &server_nonce,
        &client_nonce,
    );

    let civ = derive_iv(&client_nonce);
    let siv = derive_iv(&server_nonce);
    (
        session_ciphers(&client_key, &civ, &siv).unwrap(),
        session_ciphers(&server_key, &siv, &civ).unwrap(),
    )
}

// ── Ed25519 ──────────────────────────────────────────────────────────────

#[test]
fn keypair_generate_unique() {
    let kp1 = IdentityKeyPair::generate();
    let kp2 = IdentityKeyPair::generate();
    assert_ne!(kp1.public_key_bytes(), kp2.public_key_bytes());
    assert_ne!(kp1.identity(), kp2.identity());
}

#[test]
fn verify_with_raw_pubkey() {
    let kp = IdentityKeyPair::generate();
    let msg = b"verify_signature standalone";
    let sig = kp.sign(msg);
    verify_signature(&kp.public_key_bytes(), msg, &sig).expect("valid signature");

    let other = IdentityKeyPair::generate();
    assert!(matches!(
        verify_signature(&other.public_key_bytes(), msg, &sig),
        Err(TrustError::SignatureVerification)
    ));
}

// ── Key agreement ────────────────────────────────────────────────────────

#[test]
fn dhe_and_ecdhe_agree() {
    for alg in [KeyAgreementAlgorithm::Dhe2048, KeyAgreementAlgorithm::EcdheX25519] {
        let a = EphemeralKeyPair::generate(alg).unwrap();
        let b = EphemeralKeyPair::generate(alg).unwrap();
        assert_eq!(
            a.agree(b.public_key_bytes()).unwrap().as_bytes(),
            b.agree(a.public_key_bytes()).unwrap().as_bytes()
        );
    }
}

#[test]
fn mixed_algorithms_fail() {
    let dhe = EphemeralKeyPair::generate(KeyAgreementAlgorithm::Dhe2048).unwrap();
    let ecdhe = EphemeralKeyPair::generate(KeyAgreementAlgorithm::EcdheX25519).unwrap();
    assert!(dhe.agree(ecdhe.public_key_bytes()).is_err());
    assert!(ecdhe.agree(dhe.public_key_bytes()).is_err());
}

// ── PSK ──────────────────────────────────────────────────────────────────

#[test]
fn psk_tag_bound_to_nonces() {
    let psk = PreSharedKey::new(b"correct horse".to_vec());
    let sn = random_nonce();
    let cn = random_nonce();
    let tag = psk_tag(&psk, b"ephemeral", &sn, &cn).unwrap();
    verify_psk_tag(&psk, b"ephemeral", &sn, &cn, &tag).unwrap();
    assert!(verify_psk_tag(&psk, b"ephemeral", &random_nonce(), &cn, &tag).is_err());
}

// ── Framing ──────────────────────────────────────────────────────────────

#[test]
fn both_directions_round_trip() {
    let ((mut c_seal, mut c_open), (mut s_seal, mut s_open)) = client_server_ciphers();

    for i in 0..5u8 {
        let mut out = BytesMut::new();
        c_seal.seal(FLAG_DATA, &[i; 40], &mut out).unwrap();
        let (flags, payload) = s_open.open(&mut out).unwrap();
        assert_eq!(flags, FLAG_DATA);
        assert_eq!(payload, &[i; 40]);

        let mut out = BytesMut::new();
        s_seal.seal(FLAG_DATA, &[i ^ 0xFF; 17], &mut out).unwrap();
        assert_eq!(c_open.open(&mut out).unwrap().1, &[i ^ 0xFF; 17]);
    }

    let mut out = BytesMut::new();
    c_seal.seal(FLAG_CLOSE_CHANNEL, &[], &mut out).unwrap();
    assert_eq!(s_open.open(&mut out).unwrap().0, FLAG_CLOSE_CHANNEL);
}

#[test]
fn same_payload_encrypts_differently() {
    let ((mut c_seal, _), _) = client_server_ciphers();
    let mut a = BytesMut::new();
    let mut b = BytesMut::new();
    c_seal.seal(FLAG_DATA, b"repeat", &mut a).unwrap();
    c_seal.seal(FLAG_DATA, b"repeat", &mut b).unwrap();
    assert_ne!(a, b);
}

#[test]
fn every_bit_flip_is_detected() {
    let key = MasterKey::from_bytes([0x11; 32]);
    let iv = [0x22; 16];
    let mut sealer = FrameSealer::new(&key, &iv).unwrap();
    let mut sealed = BytesMut::new();
    sealer.seal(FLAG_DATA, b"attack at dawn, bring snacks", &mut sealed).unwrap();

    for bit in 0..sealed.len() * 8 {
        let mut tampered = sealed.to_vec();
        tampered[bit / 8] ^= 1 << (bit % 8);

        let mut opener = FrameOpener::new(&key, &iv).unwrap();
        if bit < BLOCK_SIZE * 8 {
            // A flipped first block may already show an impossible length.
            if let Err(err) = opener.frame_len(&tampered[..BLOCK_SIZE]) {
                assert!(matches!(err, TrustError::MessageAuthentication));
                continue;
            }
        }
        assert!(
            matches!(opener.open(&mut tampered), Err(TrustError::MessageAuthentication)),
            "bit {bit} flip went undetected"
        );
    }
}

#[test]
fn frames_must_be_opened_in_order() {
    let key = MasterKey::from_bytes([0x33; 32]);
    let iv = [0x44; 16];
    let mut sealer = FrameSealer::new(&key, &iv).unwrap();
    let mut first = BytesMut::new();
    let mut second = BytesMut::new();
    sealer.seal(FLAG_DATA, b"first", &mut first).unwrap();
    sealer.seal(FLAG_DATA, b"second", &mut second).unwrap();

    // MAC is valid, but the chain is not where this frame expects it.
    let mut skipped = second.clone();
    let mut opener = FrameOpener::new(&key, &iv).unwrap();
    match opener.open(&mut skipped) {
        Ok((_, payload)) => assert_ne!(payload, b"second"),
        Err(err) => assert!(matches!(err, TrustError::MessageAuthentication)),
    }

    let mut opener = FrameOpener::new(&key, &iv).unwrap();
    assert_eq!(first.len(), BLOCK_SIZE + MAC_SIZE);
    assert_eq!(opener.open(&mut first).unwrap().1, b"first");
    assert_eq!(opener.open(&mut second).unwrap().1, b"second");
}
