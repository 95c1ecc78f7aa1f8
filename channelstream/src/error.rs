use std::fmt;
use std::net::SocketAddr;

use channeltrust::{Identity, StatusCode, TrustError};
use thiserror::Error;

/// A protocol failure carrying its wire status code.
///
/// Raised by the handshake and by renegotiation. Once enriched it names the
/// remote endpoint and, when already authenticated, the peer identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureChannelError {
    pub code: StatusCode,
    /// The code the peer sent when `code` is [`StatusCode::RemoteError`].
    pub remote_status: Option<StatusCode>,
    pub remote: Option<SocketAddr>,
    pub peer_identity: Option<Identity>,
    pub reason: String,
}

impl SecureChannelError {
    pub fn new(code: StatusCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            remote_status: None,
            remote: None,
            peer_identity: None,
            reason: reason.into(),
        }
    }

    /// The peer reported `code` and is about to drop the connection.
    pub fn remote(code: StatusCode) -> Self {
        Self {
            remote_status: Some(code),
            ..Self::new(StatusCode::RemoteError, format!("peer reported {code}"))
        }
    }

    pub fn with_endpoint(mut self, remote: Option<SocketAddr>) -> Self {
        if self.remote.is_none() {
            self.remote = remote;
        }
        self
    }

    pub fn with_peer_identity(mut self, identity: Option<Identity>) -> Self {
        if self.peer_identity.is_none() {
            self.peer_identity = identity;
        }
        self
    }
}

impl fmt::Display for SecureChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.reason)?;
        if let Some(remote) = self.remote {
            write!(f, " (remote {remote})")?;
        }
        if let Some(identity) = &self.peer_identity {
            write!(f, " (peer {identity})")?;
        }
        Ok(())
    }
}

impl std::error::Error for SecureChannelError {}

/// All errors produced by the channel layer.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("secure channel failure: {0}")]
    Secure(#[from] SecureChannelError),

    #[error("remote peer reported {0}")]
    RemoteStatus(StatusCode),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("secure session not established")]
    NotEstablished,

    #[error("channel is closed")]
    Closed,

    #[error("crypto error: {0}")]
    Trust(#[from] TrustError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChannelError {
    /// The wire status code that describes this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ChannelError::Secure(err) => err.code,
            ChannelError::RemoteStatus(_) => StatusCode::RemoteError,
            ChannelError::Trust(TrustError::MessageAuthentication) => {
                StatusCode::MessageAuthenticationFailed
            }
            ChannelError::Trust(TrustError::SignatureVerification) => {
                StatusCode::PeerAuthenticationFailed
            }
            _ => StatusCode::UnknownException,
        }
    }

    /// Whether a handshake failing with this error tells the peer why.
    ///
    /// Transport failures cannot be reported, and a MAC failure means the
    /// session is already out of step.
    pub fn is_reported_to_peer(&self) -> bool {
        match self {
            ChannelError::Io(_) | ChannelError::Closed | ChannelError::RemoteStatus(_) => false,
            _ => {
                let code = self.status_code();
                code.is_reportable() && code != StatusCode::MessageAuthenticationFailed
            }
        }
    }

    /// True for failures of the underlying transport rather than the protocol.
    pub fn is_transport(&self) -> bool {
        matches!(self, ChannelError::Io(_) | ChannelError::Closed)
    }

    /// Convert to a [`SecureChannelError`], keeping the status code.
    pub fn into_secure(self) -> SecureChannelError {
        match self {
            ChannelError::Secure(err) => err,
            ChannelError::RemoteStatus(code) => SecureChannelError::remote(code),
            other => SecureChannelError::new(other.status_code(), other.to_string()),
        }
    }
}

/// Shorthand for a protocol rejection with the given status code.
pub(crate) fn reject(code: StatusCode, reason: impl Into<String>) -> ChannelError {
    ChannelError::Secure(SecureChannelError::new(code, reason))
}

pub type Result<T> = std::result::Result<T, ChannelError>;
