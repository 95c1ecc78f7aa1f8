// Wire status codes carried in the first byte of every handshake message.

use std::fmt;

/// Status code reported to (or by) the remote peer.
///
/// A handshake message whose leading status byte is non-zero carries no
/// further fields: the peer is reporting why it is about to drop the
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StatusCode {
    Success = 0,
    /// The peer reported a failure. Only ever raised locally.
    RemoteError = 1,
    ProtocolVersionNotSupported = 2,
    NoMatchingCipherAvailable = 3,
    NoMatchingOptionsAvailable = 4,
    PskAuthenticationFailed = 5,
    PeerAuthenticationFailed = 6,
    UntrustedRemotePeerUserId = 7,
    MessageAuthenticationFailed = 8,
    RenegotiationFailed = 9,
    /// Opaque local fault. Sent without detail.
    UnknownException = 254,
}

impl StatusCode {
    /// The wire byte for this code.
    pub fn wire(self) -> u8 {
        self as u8
    }

    /// Resolve a wire byte. Unassigned values yield `None`.
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(StatusCode::Success),
            1 => Some(StatusCode::RemoteError),
            2 => Some(StatusCode::ProtocolVersionNotSupported),
            3 => Some(StatusCode::NoMatchingCipherAvailable),
            4 => Some(StatusCode::NoMatchingOptionsAvailable),
            5 => Some(StatusCode::PskAuthenticationFailed),
            6 => Some(StatusCode::PeerAuthenticationFailed),
            7 => Some(StatusCode::UntrustedRemotePeerUserId),
            8 => Some(StatusCode::MessageAuthenticationFailed),
            9 => Some(StatusCode::RenegotiationFailed),
            254 => Some(StatusCode::UnknownException),
            _ => None,
        }
    }

    /// Whether a local failure with this code is reported to the peer.
    pub fn is_reportable(self) -> bool {
        !matches!(self, StatusCode::Success | StatusCode::RemoteError)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusCode::Success => "Success",
            StatusCode::RemoteError => "RemoteError",
            StatusCode::ProtocolVersionNotSupported => "ProtocolVersionNotSupported",
            StatusCode::NoMatchingCipherAvailable => "NoMatchingCipherAvailable",
            StatusCode::NoMatchingOptionsAvailable => "NoMatchingOptionsAvailable",
            StatusCode::PskAuthenticationFailed => "PskAuthenticationFailed",
            StatusCode::PeerAuthenticationFailed => "PeerAuthenticationFailed",
            StatusCode::UntrustedRemotePeerUserId => "UntrustedRemotePeerUserId",
            StatusCode::MessageAuthenticationFailed => "MessageAuthenticationFailed",
            StatusCode::RenegotiationFailed => "RenegotiationFailed",
            StatusCode::UnknownException => "UnknownException",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_values_resolve() {
        for code in [
            StatusCode::Success,
            StatusCode::RemoteError,
            StatusCode::ProtocolVersionNotSupported,
            StatusCode::NoMatchingCipherAvailable,
            StatusCode::NoMatchingOptionsAvailable,
            StatusCode::PskAuthenticationFailed,
            StatusCode::PeerAuthenticationFailed,
            StatusCode::UntrustedRemotePeerUserId,
            StatusCode::MessageAuthenticationFailed,
            StatusCode::RenegotiationFailed,
            StatusCode::UnknownException,
        ] {
            assert_eq!(StatusCode::from_wire(code.wire()), Some(code));
        }
        assert_eq!(StatusCode::from_wire(0x42), None);
    }

    #[test]
    fn remote_error_is_never_reported() {
        assert!(!StatusCode::RemoteError.is_reportable());
        assert!(!StatusCode::Success.is_reportable());
        assert!(StatusCode::UnknownException.is_reportable());
        assert!(StatusCode::PskAuthenticationFailed.is_reportable());
    }
}
