// Long-term Ed25519 identity key pair and signature verification.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use zeroize::Zeroizing;

use crate::error::{Result, TrustError};
use crate::identity::{generate_identity, is_identity_valid, Identity};

/// Length of an Ed25519 public key.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Length of an Ed25519 signature.
pub const SIGNATURE_LEN: usize = 64;

/// An Ed25519 key pair together with the identity derived from its public key.
///
/// The signing key is wiped on drop.
pub struct IdentityKeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    identity: Identity,
}

impl IdentityKeyPair {
    /// Generate a fresh random key pair and derive its identity.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        let identity = generate_identity(verifying_key.as_bytes());
        Self {
            signing_key,
            verifying_key,
            identity,
        }
    }

    /// Rebuild a persisted key pair.
    ///
    /// Fails if `identity` was not derived from the seed's public key.
    pub fn from_parts(seed: &[u8; 32], identity: Identity) -> Result<Self> {
        let signing_key = SigningKey::from_bytes(seed);
        let verifying_key = signing_key.verifying_key();
        if !is_identity_valid(verifying_key.as_bytes(), identity.as_bytes()) {
            return Err(TrustError::InvalidIdentity(
                "identity does not match key pair".into(),
            ));
        }
        Ok(Self {
            signing_key,
            verifying_key,
            identity,
        })
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    /// The 32-byte Ed25519 public key.
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.verifying_key.to_bytes()
    }

    /// The 32-byte secret seed, for persisting alongside the identity.
    pub fn secret_key_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing_key.to_bytes())
    }

    pub fn sign(&self, data: &[u8]) -> [u8; SIGNATURE_LEN] {
        let sig: Signature = self.signing_key.sign(data);
        sig.to_bytes()
    }

    pub fn verify(&self, data: &[u8], signature: &[u8]) -> Result<()> {
        verify_signature(self.verifying_key.as_bytes(), data, signature)
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

/// Verify a signature made by the holder of `public_key`.
///
/// Key and signature arrive from the wire as arbitrary slices; wrong lengths
/// and malformed keys are rejected.
pub fn verify_signature(public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<()> {
    let pk: &[u8; PUBLIC_KEY_LEN] = public_key.try_into().map_err(|_| {
        TrustError::InvalidKey(format!(
            "public key must be {PUBLIC_KEY_LEN} bytes, got {}",
            public_key.len()
        ))
    })?;
    let sig: &[u8; SIGNATURE_LEN] = signature
        .try_into()
        .map_err(|_| TrustError::SignatureVerification)?;

    let vk = VerifyingKey::from_bytes(pk).map_err(|e| TrustError::InvalidKey(format!("{e}")))?;
    vk.verify(message, &Signature::from_bytes(sig))
        .map_err(|_| TrustError::SignatureVerification)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypair_round_trip() {
        let kp = IdentityKeyPair::generate();
        let seed = kp.secret_key_bytes();
        let kp2 = IdentityKeyPair::from_parts(&seed, kp.identity()).unwrap();
        assert_eq!(kp.public_key_bytes(), kp2.public_key_bytes());
        assert_eq!(kp.identity(), kp2.identity());
    }

    #[test]
    fn from_parts_rejects_foreign_identity() {
        let kp = IdentityKeyPair::generate();
        let other = IdentityKeyPair::generate();
        assert!(IdentityKeyPair::from_parts(&kp.secret_key_bytes(), other.identity()).is_err());
    }

    #[test]
    fn sign_verify() {
        let kp = IdentityKeyPair::generate();
        let sig = kp.sign(b"hello channel");
        kp.verify(b"hello channel", &sig).expect("signature should be valid");
        assert!(kp.verify(b"wrong message", &sig).is_err());
    }

    #[test]
    fn verify_rejects_bad_lengths() {
        let kp = IdentityKeyPair::generate();
        let sig = kp.sign(b"m");
        assert!(verify_signature(&kp.public_key_bytes()[..31], b"m", &sig).is_err());
        assert!(verify_signature(&kp.public_key_bytes(), b"m", &sig[..63]).is_err());
    }
}
