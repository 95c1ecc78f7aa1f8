// ChannelTrust - identity, key agreement and packet protection for the secure channel.
//
// Crate root: module declarations and public re-exports.

pub mod error;
pub mod crypto;
pub mod identity;
pub mod status;
pub mod suite;

// Re-export key types at crate root for convenience.
pub use crypto::keys::IdentityKeyPair;
pub use error::{Result, TrustError};
pub use identity::Identity;
pub use status::StatusCode;
pub use suite::{ChannelOptions, CipherSuite, CipherSuites};
