// Cipher-suite and channel-option flag sets negotiated in the Hello exchange.
//
// Every suite pairs a key agreement with AES-256-CBC + HMAC-SHA256:
//   0x01 DHE-2048   anonymous
//   0x02 DHE-2048   identity-authenticated
//   0x04 ECDHE-X25519 anonymous
//   0x08 ECDHE-X25519 identity-authenticated

use std::fmt;
use std::ops::BitOr;

use serde::{Deserialize, Serialize};

use crate::crypto::key_agreement::KeyAgreementAlgorithm;

/// A single negotiable algorithm bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CipherSuite {
    DheAnonWithAes256CbcHmacSha256 = 0x01,
    DheIdentityWithAes256CbcHmacSha256 = 0x02,
    EcdheAnonWithAes256CbcHmacSha256 = 0x04,
    EcdheIdentityWithAes256CbcHmacSha256 = 0x08,
}

impl CipherSuite {
    /// Server selection order, most preferred first.
    pub const PRIORITY: [CipherSuite; 4] = [
        CipherSuite::EcdheIdentityWithAes256CbcHmacSha256,
        CipherSuite::DheIdentityWithAes256CbcHmacSha256,
        CipherSuite::EcdheAnonWithAes256CbcHmacSha256,
        CipherSuite::DheAnonWithAes256CbcHmacSha256,
    ];

    /// The flag bit for this suite.
    pub fn bit(self) -> u8 {
        self as u8
    }

    /// The ephemeral key agreement used by this suite.
    pub fn key_agreement(self) -> KeyAgreementAlgorithm {
        match self {
            CipherSuite::DheAnonWithAes256CbcHmacSha256
            | CipherSuite::DheIdentityWithAes256CbcHmacSha256 => KeyAgreementAlgorithm::Dhe2048,
            CipherSuite::EcdheAnonWithAes256CbcHmacSha256
            | CipherSuite::EcdheIdentityWithAes256CbcHmacSha256 => {
                KeyAgreementAlgorithm::EcdheX25519
            }
        }
    }

    /// Whether the handshake runs the identity-authentication phase.
    pub fn requires_identity(self) -> bool {
        matches!(
            self,
            CipherSuite::DheIdentityWithAes256CbcHmacSha256
                | CipherSuite::EcdheIdentityWithAes256CbcHmacSha256
        )
    }
}

impl fmt::Display for CipherSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CipherSuite::DheAnonWithAes256CbcHmacSha256 => "DHE2048_ANON_WITH_AES256_CBC_HMAC_SHA256",
            CipherSuite::DheIdentityWithAes256CbcHmacSha256 => {
                "DHE2048_IDENTITY_WITH_AES256_CBC_HMAC_SHA256"
            }
            CipherSuite::EcdheAnonWithAes256CbcHmacSha256 => {
                "ECDHE_X25519_ANON_WITH_AES256_CBC_HMAC_SHA256"
            }
            CipherSuite::EcdheIdentityWithAes256CbcHmacSha256 => {
                "ECDHE_X25519_IDENTITY_WITH_AES256_CBC_HMAC_SHA256"
            }
        };
        f.write_str(name)
    }
}

/// A set of cipher suites, carried on the wire as a flag byte.
///
/// Bits that do not name a known suite are kept for the wire round trip but
/// never match during negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CipherSuites(u8);

impl CipherSuites {
    pub const NONE: Self = Self(0x00);
    pub const ALL: Self = Self(0x0F);
    pub const ANONYMOUS: Self = Self(0x05);
    pub const IDENTITY: Self = Self(0x0A);

    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, suite: CipherSuite) -> bool {
        self.0 & suite.bit() != 0
    }

    pub fn with(self, suite: CipherSuite) -> Self {
        Self(self.0 | suite.bit())
    }

    pub fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// True when no known suite is present.
    pub fn is_empty(self) -> bool {
        self.iter().next().is_none()
    }

    /// Known suites in this set, in server priority order.
    pub fn iter(self) -> impl Iterator<Item = CipherSuite> {
        CipherSuite::PRIORITY
            .into_iter()
            .filter(move |suite| self.contains(*suite))
    }

    /// The most preferred suite in this set.
    pub fn preferred(self) -> Option<CipherSuite> {
        self.iter().next()
    }

    /// The suite named by this set when it names exactly one known suite and
    /// carries no other bits.
    pub fn single(self) -> Option<CipherSuite> {
        let mut known = self.iter();
        match (known.next(), known.next()) {
            (Some(suite), None) if self.0 == suite.bit() => Some(suite),
            _ => None,
        }
    }
}

impl From<CipherSuite> for CipherSuites {
    fn from(suite: CipherSuite) -> Self {
        Self(suite.bit())
    }
}

impl BitOr for CipherSuites {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Behaviour flags both ends must present identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelOptions(u8);

impl ChannelOptions {
    pub const NONE: Self = Self(0x00);
    pub const PRE_SHARED_KEY_AUTHENTICATION_REQUIRED: Self = Self(0x01);
    pub const CLIENT_AUTHENTICATION_REQUIRED: Self = Self(0x02);

    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, flag: ChannelOptions) -> bool {
        (self.0 & flag.0) == flag.0
    }
}

impl BitOr for ChannelOptions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_priority_prefers_identity_ecdhe() {
        assert_eq!(
            CipherSuites::ALL.preferred(),
            Some(CipherSuite::EcdheIdentityWithAes256CbcHmacSha256)
        );
        assert_eq!(
            CipherSuites::ANONYMOUS.preferred(),
            Some(CipherSuite::EcdheAnonWithAes256CbcHmacSha256)
        );
        let dhe_only = CipherSuites::from(CipherSuite::DheAnonWithAes256CbcHmacSha256)
            .with(CipherSuite::DheIdentityWithAes256CbcHmacSha256);
        assert_eq!(
            dhe_only.preferred(),
            Some(CipherSuite::DheIdentityWithAes256CbcHmacSha256)
        );
    }

    #[test]
    fn unknown_bits_never_negotiate() {
        let unknown = CipherSuites::from_bits(0xF0);
        assert!(unknown.is_empty());
        assert_eq!(unknown.preferred(), None);
        assert_eq!(CipherSuites::from_bits(0x14).single(), None);
    }

    #[test]
    fn single_requires_exactly_one_suite() {
        assert_eq!(
            CipherSuites::from_bits(0x04).single(),
            Some(CipherSuite::EcdheAnonWithAes256CbcHmacSha256)
        );
        assert_eq!(CipherSuites::from_bits(0x05).single(), None);
        assert_eq!(CipherSuites::NONE.single(), None);
    }

    #[test]
    fn option_flags_combine() {
        let both = ChannelOptions::PRE_SHARED_KEY_AUTHENTICATION_REQUIRED
            | ChannelOptions::CLIENT_AUTHENTICATION_REQUIRED;
        assert_eq!(both.bits(), 0x03);
        assert!(both.contains(ChannelOptions::CLIENT_AUTHENTICATION_REQUIRED));
        assert!(!ChannelOptions::NONE.contains(ChannelOptions::CLIENT_AUTHENTICATION_REQUIRED));
    }

    #[test]
    fn suite_properties() {
        assert!(CipherSuite::DheIdentityWithAes256CbcHmacSha256.requires_identity());
        assert!(!CipherSuite::EcdheAnonWithAes256CbcHmacSha256.requires_identity());
        assert_eq!(
            CipherSuite::DheAnonWithAes256CbcHmacSha256.key_agreement(),
            KeyAgreementAlgorithm::Dhe2048
        );
    }
}
