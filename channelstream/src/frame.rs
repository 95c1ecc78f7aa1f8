use bytes::Bytes;

use channeltrust::crypto::cipher::{FLAG_CLOSE_CHANNEL, FLAG_DATA, FLAG_RENEGOTIATE};

/// What a secure packet carries, taken from its flags byte.
///
/// Flag values other than RENEGOTIATE and CLOSE_CHANNEL are plain data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Data,
    /// Request, or echo of a request, to re-run the handshake.
    Renegotiate,
    /// The peer will send nothing further.
    CloseChannel,
}

impl FrameKind {
    pub fn flags(self) -> u8 {
        match self {
            FrameKind::Data => FLAG_DATA,
            FrameKind::Renegotiate => FLAG_RENEGOTIATE,
            FrameKind::CloseChannel => FLAG_CLOSE_CHANNEL,
        }
    }
}

impl From<u8> for FrameKind {
    fn from(flags: u8) -> Self {
        match flags {
            FLAG_RENEGOTIATE => FrameKind::Renegotiate,
            FLAG_CLOSE_CHANNEL => FrameKind::CloseChannel,
            _ => FrameKind::Data,
        }
    }
}

/// An opened secure packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_flags_are_data() {
        assert_eq!(FrameKind::from(0), FrameKind::Data);
        assert_eq!(FrameKind::from(1), FrameKind::Renegotiate);
        assert_eq!(FrameKind::from(2), FrameKind::CloseChannel);
        assert_eq!(FrameKind::from(3), FrameKind::Data);
        assert_eq!(FrameKind::from(0xFF), FrameKind::Data);
    }

    #[test]
    fn flags_round_trip() {
        for kind in [FrameKind::Data, FrameKind::Renegotiate, FrameKind::CloseChannel] {
            assert_eq!(FrameKind::from(kind.flags()), kind);
        }
    }
}
