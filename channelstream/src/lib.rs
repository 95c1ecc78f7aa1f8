//! ChannelStream -- a secure channel over any ordered byte transport.
//!
//! Two peers run a handshake that agrees on a cipher suite, exchanges
//! ephemeral keys (optionally gated by a pre-shared key), and authenticates
//! long-term identities when the suite calls for it. Application data then
//! flows in AES-256-CBC frames with an HMAC-SHA256 tag over the ciphertext.
//! Either side may renegotiate at any time, on demand or when a byte or age
//! threshold is reached.
//!
//! Cipher suites, in server preference order:
//! - **ECDHE with identity**: X25519 key agreement, Ed25519 identities
//! - **DHE with identity**: 2048-bit MODP key agreement, Ed25519 identities
//! - **ECDHE anonymous**
//! - **DHE anonymous**

pub mod channel;
pub mod config;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod message;
mod renegotiation;
pub mod session;

// Re-export key public types at crate root.
pub use channel::{SecureChannel, Transport};
pub use config::{ChannelConfig, Credentials, RenegotiationPolicy, Role};
pub use error::{ChannelError, Result, SecureChannelError};
pub use frame::{Frame, FrameKind};
pub use session::SessionInfo;

pub use channeltrust::crypto::kdf::PreSharedKey;
pub use channeltrust::{
    ChannelOptions, CipherSuite, CipherSuites, Identity, IdentityKeyPair, StatusCode,
};
