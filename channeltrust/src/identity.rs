// Short peer identities bound to a long-term public key.
//
// identity = salt(4) || HMAC-SHA256(key = salt, msg = public_key)[4..20]

use std::fmt;
use std::str::FromStr;

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{Result, TrustError};

type HmacSha256 = Hmac<Sha256>;

/// Length of an identity on the wire.
pub const IDENTITY_LEN: usize = 20;

/// Length of the salt embedded at the front of an identity.
pub const SALT_LEN: usize = 4;

/// A 20-byte identity derived from a public key and a 4-byte salt.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Identity([u8; IDENTITY_LEN]);

impl Identity {
    pub fn from_bytes(bytes: [u8; IDENTITY_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse from a slice that must be exactly [`IDENTITY_LEN`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; IDENTITY_LEN] = bytes.try_into().map_err(|_| {
            TrustError::InvalidIdentity(format!(
                "identity must be {IDENTITY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; IDENTITY_LEN] {
        &self.0
    }

    /// The salt this identity was derived with.
    pub fn salt(&self) -> [u8; SALT_LEN] {
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&self.0[..SALT_LEN]);
        salt
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", hex::encode(self.0))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for Identity {
    type Err = TrustError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes =
            hex::decode(s.trim()).map_err(|e| TrustError::InvalidIdentity(format!("{e}")))?;
        Self::from_slice(&bytes)
    }
}

impl Serialize for Identity {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Identity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Derive the identity of `public_key` under `salt`.
pub fn derive_identity(public_key: &[u8], salt: [u8; SALT_LEN]) -> Identity {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(&salt).expect("HMAC accepts keys of any length");
    mac.update(public_key);
    let digest = mac.finalize().into_bytes();

    let mut id = [0u8; IDENTITY_LEN];
    id.copy_from_slice(&digest[..IDENTITY_LEN]);
    id[..SALT_LEN].copy_from_slice(&salt);
    Identity(id)
}

/// Derive an identity for `public_key` under a fresh random salt.
pub fn generate_identity(public_key: &[u8]) -> Identity {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    derive_identity(public_key, salt)
}

/// Check that `candidate` was derived from `public_key`.
///
/// The salt is taken from the candidate itself. Returns `false` for a
/// candidate of the wrong length; never errors.
pub fn is_identity_valid(public_key: &[u8], candidate: &[u8]) -> bool {
    if candidate.len() != IDENTITY_LEN {
        return false;
    }
    let mut salt = [0u8; SALT_LEN];
    salt.copy_from_slice(&candidate[..SALT_LEN]);
    let expected = derive_identity(public_key, salt);
    expected.0.ct_eq(candidate).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn salt_is_embedded() {
        let id = derive_identity(b"public key", [1, 2, 3, 4]);
        assert_eq!(id.salt(), [1, 2, 3, 4]);
        assert_eq!(&id.as_bytes()[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn hex_round_trip() {
        let id = generate_identity(b"some key");
        let parsed: Identity = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("abcd".parse::<Identity>().is_err());
        assert!("zz".repeat(20).parse::<Identity>().is_err());
    }

    #[test]
    fn wrong_length_is_invalid() {
        let id = generate_identity(b"k");
        assert!(!is_identity_valid(b"k", &id.as_bytes()[..19]));
        assert!(!is_identity_valid(b"k", &[]));
    }
}
