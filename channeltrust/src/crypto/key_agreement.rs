// Ephemeral key agreement: finite-field DHE over the RFC 3526 2048-bit MODP
// group and X25519 ECDHE. One fresh key pair per handshake.

use num_bigint::BigUint;
use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::error::{Result, TrustError};

/// RFC 3526 group 14 prime (2048-bit MODP), generator 2.
const MODP_2048_PRIME: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1",
    "29024E088A67CC74020BBEA63B139B22514A08798E3404DD",
    "EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245",
    "E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D",
    "C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F",
    "83655D23DCA3AD961C62F356208552BB9ED529077096966D",
    "670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B",
    "E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9",
    "DE2BCBF6955817183995497CEA956AE515D2261898FA0510",
    "15728E5A8AACAA68FFFFFFFFFFFFFFFF",
);

const MODP_2048_GENERATOR: u32 = 2;

/// Length of a DHE-2048 public value or shared secret on the wire.
pub const DHE_2048_KEY_LEN: usize = 256;

/// Length of the DHE private exponent.
const DHE_PRIVATE_LEN: usize = 32;

/// Key agreement algorithm selected by the negotiated cipher suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyAgreementAlgorithm {
    Dhe2048,
    EcdheX25519,
}

/// Raw key-agreement output. Wiped on drop.
pub struct SharedSecret(Zeroizing<Vec<u8>>);

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

fn modp_prime() -> Result<BigUint> {
    BigUint::parse_bytes(MODP_2048_PRIME.as_bytes(), 16)
        .ok_or_else(|| TrustError::KeyAgreement("invalid MODP group constant".into()))
}

/// Left-pad a big-endian integer to a fixed width.
fn to_fixed_be(value: &BigUint, len: usize) -> Vec<u8> {
    let bytes = value.to_bytes_be();
    let mut out = vec![0u8; len.saturating_sub(bytes.len())];
    out.extend_from_slice(&bytes);
    out
}

/// A DHE-2048 ephemeral key pair.
pub struct DhKeyPair {
    private: Zeroizing<[u8; DHE_PRIVATE_LEN]>,
    public: Vec<u8>,
}

impl DhKeyPair {
    /// Generate a new random ephemeral key pair.
    pub fn generate() -> Result<Self> {
        let mut private = Zeroizing::new([0u8; DHE_PRIVATE_LEN]);
        OsRng.fill_bytes(&mut private[..]);
        // Keep the exponent well away from trivial values.
        private[0] |= 0x80;

        let p = modp_prime()?;
        let x = BigUint::from_bytes_be(&private[..]);
        let y = BigUint::from(MODP_2048_GENERATOR).modpow(&x, &p);
        Ok(Self {
            private,
            public: to_fixed_be(&y, DHE_2048_KEY_LEN),
        })
    }

    /// The 256-byte public value.
    pub fn public_key_bytes(&self) -> &[u8] {
        &self.public
    }

    /// Compute the shared secret with a peer's public value.
    ///
    /// Rejects values outside `(1, p - 1)`, which would force the secret into
    /// a trivial subgroup.
    pub fn diffie_hellman(&self, peer_public: &[u8]) -> Result<SharedSecret> {
        if peer_public.len() != DHE_2048_KEY_LEN {
            return Err(TrustError::KeyAgreement(format!(
                "DHE public value must be {DHE_2048_KEY_LEN} bytes, got {}",
                peer_public.len()
            )));
        }
        let p = modp_prime()?;
        let one = BigUint::from(1u32);
        let y = BigUint::from_bytes_be(peer_public);
        if y <= one || y >= &p - &one {
            return Err(TrustError::KeyAgreement("DHE public value out of range".into()));
        }

        let x = BigUint::from_bytes_be(&self.private[..]);
        let shared = y.modpow(&x, &p);
        if shared <= one {
            return Err(TrustError::KeyAgreement("degenerate DHE shared secret".into()));
        }
        Ok(SharedSecret(Zeroizing::new(to_fixed_be(
            &shared,
            DHE_2048_KEY_LEN,
        ))))
    }
}

/// An X25519 ephemeral key pair for one handshake.
pub struct X25519KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl X25519KeyPair {
    /// Generate a new random ephemeral keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Create from existing secret bytes (used in deterministic tests).
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// The 32-byte public key.
    pub fn public_key_bytes(&self) -> &[u8] {
        self.public.as_bytes()
    }

    /// Perform Diffie-Hellman with a peer's public key.
    ///
    /// Low-order peer points produce an all-zero output and are rejected.
    pub fn diffie_hellman(&self, peer_public: &[u8]) -> Result<SharedSecret> {
        let peer: [u8; 32] = peer_public.try_into().map_err(|_| {
            TrustError::KeyAgreement(format!(
                "X25519 public key must be 32 bytes, got {}",
                peer_public.len()
            ))
        })?;
        let shared = self.secret.diffie_hellman(&PublicKey::from(peer));
        if !shared.was_contributory() {
            return Err(TrustError::KeyAgreement("non-contributory X25519 point".into()));
        }
        Ok(SharedSecret(Zeroizing::new(shared.as_bytes().to_vec())))
    }
}

/// Ephemeral key pair for whichever algorithm the suite selected.
pub enum EphemeralKeyPair {
    Dhe(DhKeyPair),
    Ecdhe(X25519KeyPair),
}

impl EphemeralKeyPair {
    /// Generate a fresh key pair for `algorithm`.
    pub fn generate(algorithm: KeyAgreementAlgorithm) -> Result<Self> {
        Ok(match algorithm {
            KeyAgreementAlgorithm::Dhe2048 => EphemeralKeyPair::Dhe(DhKeyPair::generate()?),
            KeyAgreementAlgorithm::EcdheX25519 => {
                EphemeralKeyPair::Ecdhe(X25519KeyPair::generate())
            }
        })
    }

    pub fn algorithm(&self) -> KeyAgreementAlgorithm {
        match self {
            EphemeralKeyPair::Dhe(_) => KeyAgreementAlgorithm::Dhe2048,
            EphemeralKeyPair::Ecdhe(_) => KeyAgreementAlgorithm::EcdheX25519,
        }
    }

    /// Public part as sent in the KeyExchange message.
    pub fn public_key_bytes(&self) -> &[u8] {
        match self {
            EphemeralKeyPair::Dhe(kp) => kp.public_key_bytes(),
            EphemeralKeyPair::Ecdhe(kp) => kp.public_key_bytes(),
        }
    }

    pub fn agree(&self, peer_public: &[u8]) -> Result<SharedSecret> {
        match self {
            EphemeralKeyPair::Dhe(kp) => kp.diffie_hellman(peer_public),
            EphemeralKeyPair::Ecdhe(kp) => kp.diffie_hellman(peer_public),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn x25519_shared_secret_matches() {
        let alice = X25519KeyPair::generate();
        let bob = X25519KeyPair::generate();

        let alice_shared = alice.diffie_hellman(bob.public_key_bytes()).unwrap();
        let bob_shared = bob.diffie_hellman(alice.public_key_bytes()).unwrap();
        assert_eq!(alice_shared.as_bytes(), bob_shared.as_bytes());
    }

    #[test]
    fn x25519_rejects_low_order_point() {
        let alice = X25519KeyPair::generate();
        assert!(alice.diffie_hellman(&[0u8; 32]).is_err());
        assert!(alice.diffie_hellman(&[1u8; 31]).is_err());
    }

    #[test]
    fn dhe_shared_secret_matches() {
        let alice = DhKeyPair::generate().unwrap();
        let bob = DhKeyPair::generate().unwrap();
        assert_eq!(alice.public_key_bytes().len(), DHE_2048_KEY_LEN);

        let alice_shared = alice.diffie_hellman(bob.public_key_bytes()).unwrap();
        let bob_shared = bob.diffie_hellman(alice.public_key_bytes()).unwrap();
        assert_eq!(alice_shared.as_bytes(), bob_shared.as_bytes());
        assert_eq!(alice_shared.as_bytes().len(), DHE_2048_KEY_LEN);
    }

    #[test]
    fn dhe_rejects_trivial_values() {
        let alice = DhKeyPair::generate().unwrap();

        let mut one = vec![0u8; DHE_2048_KEY_LEN];
        one[DHE_2048_KEY_LEN - 1] = 1;
        assert!(alice.diffie_hellman(&one).is_err());
        assert!(alice.diffie_hellman(&[0xFF; DHE_2048_KEY_LEN]).is_err());
        assert!(alice.diffie_hellman(&[0x02; 16]).is_err());
    }

    #[test]
    fn ephemeral_dispatch_follows_algorithm() {
        let kp = EphemeralKeyPair::generate(KeyAgreementAlgorithm::EcdheX25519).unwrap();
        assert_eq!(kp.algorithm(), KeyAgreementAlgorithm::EcdheX25519);
        assert_eq!(kp.public_key_bytes().len(), 32);
    }
}
