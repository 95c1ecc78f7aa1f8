// ChannelTrust error types

use thiserror::Error;

/// Top-level error type for the ChannelTrust crate.
#[derive(Debug, Error)]
pub enum TrustError {
    // ── Key material ────────────────────────────────────────────────────
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("signature verification failed")]
    SignatureVerification,

    #[error("key agreement failed: {0}")]
    KeyAgreement(String),

    // ── Packet protection ───────────────────────────────────────────────
    #[error("cipher initialisation failed: {0}")]
    CipherInit(String),

    #[error("message authentication failed")]
    MessageAuthentication,

    #[error("payload too large: {size} bytes exceeds maximum {max}")]
    PayloadTooLarge { size: usize, max: usize },
}

/// Crate-level result alias.
pub type Result<T> = std::result::Result<T, TrustError>;
