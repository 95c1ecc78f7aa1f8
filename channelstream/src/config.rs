//! Channel configuration and credentials.
//!
//! [`ChannelConfig`] holds the negotiable parameters and timing policy and can
//! be loaded from any serde format. [`Credentials`] holds key material and is
//! deliberately not serializable.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use channeltrust::crypto::kdf::PreSharedKey;
use channeltrust::{ChannelOptions, CipherSuites, Identity, IdentityKeyPair};
use serde::{Deserialize, Serialize};

use crate::error::{ChannelError, Result};

/// Which end of the handshake this side plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => write!(f, "client"),
            Role::Server => write!(f, "server"),
        }
    }
}

/// When the background timer re-keys the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenegotiationPolicy {
    /// Re-key after this many bytes have been sent under one session.
    pub after_bytes: Option<u64>,
    /// Re-key once a session is this old.
    #[serde(with = "opt_millis")]
    pub after_duration: Option<Duration>,
    /// How often the timer checks the thresholds.
    #[serde(with = "millis")]
    pub check_interval: Duration,
}

impl RenegotiationPolicy {
    /// Whether either threshold is configured.
    pub fn is_enabled(&self) -> bool {
        self.after_bytes.is_some() || self.after_duration.is_some()
    }

    /// Whether a session with these statistics should be re-keyed.
    pub fn is_due(&self, bytes_sent: u64, age: Duration) -> bool {
        self.after_bytes.is_some_and(|limit| bytes_sent >= limit)
            || self.after_duration.is_some_and(|limit| age >= limit)
    }
}

impl Default for RenegotiationPolicy {
    fn default() -> Self {
        Self {
            after_bytes: None,
            after_duration: None,
            check_interval: Duration::from_secs(1),
        }
    }
}

/// Negotiable parameters and timing for one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Suites offered (client) or accepted (server).
    pub cipher_suites: CipherSuites,
    /// Must be identical on both ends.
    pub options: ChannelOptions,
    /// Bound on each wait for peer data, and on a whole renegotiation.
    #[serde(with = "millis")]
    pub read_timeout: Duration,
    pub renegotiation: RenegotiationPolicy,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            cipher_suites: CipherSuites::ALL,
            options: ChannelOptions::NONE,
            read_timeout: Duration::from_secs(30),
            renegotiation: RenegotiationPolicy::default(),
        }
    }
}

impl ChannelConfig {
    /// Reject combinations that could never complete a handshake.
    pub fn validate(&self, role: Role, credentials: &Credentials) -> Result<()> {
        if self.cipher_suites.is_empty() {
            return Err(ChannelError::Config("no cipher suites enabled".into()));
        }
        if self.read_timeout.is_zero() {
            return Err(ChannelError::Config("read timeout must be non-zero".into()));
        }
        if self.renegotiation.is_enabled() && self.renegotiation.check_interval.is_zero() {
            return Err(ChannelError::Config(
                "renegotiation check interval must be non-zero".into(),
            ));
        }
        if self
            .options
            .contains(ChannelOptions::PRE_SHARED_KEY_AUTHENTICATION_REQUIRED)
            && credentials.pre_shared_key.is_none()
        {
            return Err(ChannelError::Config(
                "pre-shared key authentication required but no key configured".into(),
            ));
        }
        match role {
            Role::Client => {
                if self
                    .options
                    .contains(ChannelOptions::CLIENT_AUTHENTICATION_REQUIRED)
                    && credentials.identity.is_none()
                {
                    return Err(ChannelError::Config(
                        "client authentication required but client has no identity".into(),
                    ));
                }
            }
            Role::Server => {
                if self.servable_suites(role, credentials).is_empty() {
                    return Err(ChannelError::Config(
                        "server offers only identity suites but has no identity".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Suites this side can actually run with the given credentials.
    ///
    /// A server without an identity key pair cannot authenticate itself, so
    /// it only serves anonymous suites.
    pub fn servable_suites(&self, role: Role, credentials: &Credentials) -> CipherSuites {
        match (role, &credentials.identity) {
            (Role::Server, None) => self.cipher_suites.intersection(CipherSuites::ANONYMOUS),
            _ => self.cipher_suites,
        }
    }
}

/// Key material for one side of a channel.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    /// Long-term key pair; required to authenticate this side.
    pub identity: Option<Arc<IdentityKeyPair>>,
    pub pre_shared_key: Option<PreSharedKey>,
    /// When set, only these peer identities are accepted.
    pub trusted_identities: Option<HashSet<Identity>>,
}

impl Credentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_identity(mut self, identity: Arc<IdentityKeyPair>) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_pre_shared_key(mut self, psk: PreSharedKey) -> Self {
        self.pre_shared_key = Some(psk);
        self
    }

    pub fn trust(mut self, identity: Identity) -> Self {
        self.trusted_identities
            .get_or_insert_with(HashSet::new)
            .insert(identity);
        self
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
