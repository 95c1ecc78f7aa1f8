// Master key, IV and PSK tag derivation.
//
//   master   = HKDF-Extract(salt = server_nonce || client_nonce, ikm = shared)
//   iv_x     = SHA-256(nonce_x)[..16]
//   psk_tag  = HMAC-SHA256(psk, ephemeral_public || server_nonce || client_nonce)

use std::fmt;

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::crypto::key_agreement::SharedSecret;
use crate::error::{Result, TrustError};

type HmacSha256 = Hmac<Sha256>;

pub const NONCE_LEN: usize = 32;
pub const MASTER_KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;

/// Per-handshake random nonce carried in the Hello message.
pub type Nonce = [u8; NONCE_LEN];

/// A fresh random nonce.
pub fn random_nonce() -> Nonce {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Symmetric secret shared by both sides of one cipher session.
///
/// Serves as the AES-256 key and as both HMAC keys. Wiped on drop.
pub struct MasterKey(Zeroizing<[u8; MASTER_KEY_LEN]>);

impl MasterKey {
    pub fn from_bytes(bytes: [u8; MASTER_KEY_LEN]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; MASTER_KEY_LEN] {
        &self.0
    }

    /// Non-secret fingerprint of the key, for logging and comparing sessions.
    pub fn key_id(&self) -> [u8; 8] {
        let digest = Sha256::digest(&self.0[..]);
        let mut id = [0u8; 8];
        id.copy_from_slice(&digest[..8]);
        id
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MasterKey({})", hex::encode(self.key_id()))
    }
}

/// Derive the master key of a handshake from its shared secret and both nonces.
pub fn derive_master_key(
    shared: &SharedSecret,
    server_nonce: &Nonce,
    client_nonce: &Nonce,
) -> MasterKey {
    let mut salt = [0u8; 2 * NONCE_LEN];
    salt[..NONCE_LEN].copy_from_slice(server_nonce);
    salt[NONCE_LEN..].copy_from_slice(client_nonce);

    let (prk, _) = Hkdf::<Sha256>::extract(Some(&salt), shared.as_bytes());
    let mut key = [0u8; MASTER_KEY_LEN];
    key.copy_from_slice(&prk);
    MasterKey::from_bytes(key)
}

/// Initial CBC vector for the direction written by the owner of `nonce`.
pub fn derive_iv(nonce: &Nonce) -> [u8; IV_LEN] {
    let digest = Sha256::digest(nonce);
    let mut iv = [0u8; IV_LEN];
    iv.copy_from_slice(&digest[..IV_LEN]);
    iv
}

/// A pre-shared key gating the handshake. Wiped on drop.
#[derive(Clone)]
pub struct PreSharedKey(Zeroizing<Vec<u8>>);

impl PreSharedKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(Zeroizing::new(bytes.into()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for PreSharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PreSharedKey(..)")
    }
}

fn psk_mac(
    psk: &PreSharedKey,
    ephemeral_public: &[u8],
    server_nonce: &Nonce,
    client_nonce: &Nonce,
) -> Result<HmacSha256> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(psk.as_bytes())
        .map_err(|e| TrustError::CipherInit(format!("PSK HMAC: {e}")))?;
    mac.update(ephemeral_public);
    mac.update(server_nonce);
    mac.update(client_nonce);
    Ok(mac)
}

/// Tag binding an ephemeral public key to the PSK and this handshake's nonces.
pub fn psk_tag(
    psk: &PreSharedKey,
    ephemeral_public: &[u8],
    server_nonce: &Nonce,
    client_nonce: &Nonce,
) -> Result<Vec<u8>> {
    let mac = psk_mac(psk, ephemeral_public, server_nonce, client_nonce)?;
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Constant-time check of a peer's PSK tag.
pub fn verify_psk_tag(
    psk: &PreSharedKey,
    ephemeral_public: &[u8],
    server_nonce: &Nonce,
    client_nonce: &Nonce,
    tag: &[u8],
) -> Result<()> {
    let mac = psk_mac(psk, ephemeral_public, server_nonce, client_nonce)?;
    mac.verify_slice(tag)
        .map_err(|_| TrustError::MessageAuthentication)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::key_agreement::X25519KeyPair;

    #[test]
    fn both_sides_derive_same_master_key() {
        let a = X25519KeyPair::generate();
        let b = X25519KeyPair::generate();
        let sn = random_nonce();
        let cn = random_nonce();

        let ka = derive_master_key(&a.diffie_hellman(b.public_key_bytes()).unwrap(), &sn, &cn);
        let kb = derive_master_key(&b.diffie_hellman(a.public_key_bytes()).unwrap(), &sn, &cn);
        assert_eq!(ka.as_bytes(), kb.as_bytes());
        assert_eq!(ka.key_id(), kb.key_id());
    }

    #[test]
    fn nonces_change_master_key() {
        let a = X25519KeyPair::from_secret_bytes([7; 32]);
        let b = X25519KeyPair::from_secret_bytes([9; 32]);
        let shared = a.diffie_hellman(b.public_key_bytes()).unwrap();
        let k1 = derive_master_key(&shared, &[1; 32], &[2; 32]);
        let k2 = derive_master_key(&shared, &[2; 32], &[1; 32]);
        assert_ne!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn iv_is_prefix_of_nonce_hash() {
        let nonce = [0xAB; 32];
        let iv = derive_iv(&nonce);
        assert_eq!(&iv[..], &Sha256::digest(nonce)[..16]);
    }

    #[test]
    fn psk_tag_verifies_only_with_same_inputs() {
        let psk = PreSharedKey::new(b"shared secret".to_vec());
        let sn = random_nonce();
        let cn = random_nonce();
        let tag = psk_tag(&psk, b"eph", &sn, &cn).unwrap();
        assert_eq!(tag.len(), 32);

        verify_psk_tag(&psk, b"eph", &sn, &cn, &tag).unwrap();
        assert!(verify_psk_tag(&psk, b"other", &sn, &cn, &tag).is_err());
        assert!(verify_psk_tag(&PreSharedKey::new(b"wrong".to_vec()), b"eph", &sn, &cn, &tag).is_err());
        assert!(verify_psk_tag(&psk, b"eph", &sn, &cn, &[]).is_err());
    }
}
