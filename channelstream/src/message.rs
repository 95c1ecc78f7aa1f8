//! Handshake message codec.
//!
//! Every message begins with a status byte. A non-zero status means the peer
//! is reporting a failure and nothing else follows.
//!
//! ```text
//! Hello          status(1) version(1) nonce(32) cipher_suites(1) options(1)
//! KeyExchange    status(1) eph_len(2) eph(N) tag_len(2) tag(N)
//! Authentication status(1) identity(20) pk_len(2) pk(N) sig_len(2) sig(N)
//! StatusPacket   status(1)
//! ```
//!
//! Lengths are little-endian. Variable fields are bounded by
//! [`MAX_FIELD_LEN`].

use bytes::{BufMut, BytesMut};

use channeltrust::crypto::kdf::{Nonce, NONCE_LEN};
use channeltrust::identity::IDENTITY_LEN;
use channeltrust::{ChannelOptions, CipherSuites, Identity, StatusCode};

use crate::error::{ChannelError, Result};

/// Protocol version carried in Hello.
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest accepted variable-length field.
pub const MAX_FIELD_LEN: usize = 4096;

/// A handshake message with a fixed binary layout.
pub trait WireMessage: Sized {
    /// Append the encoded message, status byte included, to `out`.
    fn encode(&self, out: &mut BytesMut);

    /// Decode one message from the front of `src`.
    ///
    /// Returns `Ok(None)` when `src` holds only a prefix of the message, and
    /// otherwise the message with the number of bytes it occupied.
    fn decode(src: &[u8]) -> Result<Option<(Self, usize)>>;
}

/// Bounds-checked reader over a message prefix.
struct Fields<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Fields<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let bytes = self.buf.get(self.pos..self.pos + n)?;
        self.pos += n;
        Some(bytes)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16_le(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_le_bytes([b[0], b[1]]))
    }

    /// Length-prefixed field. The length is checked before the body arrives.
    fn field(&mut self, what: &str) -> Result<Option<&'a [u8]>> {
        let Some(len) = self.u16_le() else {
            return Ok(None);
        };
        let len = len as usize;
        if len > MAX_FIELD_LEN {
            return Err(ChannelError::Malformed(format!(
                "{what} length {len} exceeds {MAX_FIELD_LEN}"
            )));
        }
        Ok(self.take(len))
    }

    /// Leading status byte. A non-zero status ends decoding.
    fn status(&mut self) -> Result<Option<()>> {
        match self.u8() {
            None => Ok(None),
            Some(0) => Ok(Some(())),
            Some(code) => Err(ChannelError::RemoteStatus(
                StatusCode::from_wire(code).unwrap_or(StatusCode::UnknownException),
            )),
        }
    }
}

/// Unwrap an `Option` step of a decoder, or report that more bytes are needed.
macro_rules! need {
    ($e:expr) => {
        match $e {
            Some(v) => v,
            None => return Ok(None),
        }
    };
}

fn put_field(out: &mut BytesMut, bytes: &[u8]) {
    debug_assert!(bytes.len() <= MAX_FIELD_LEN);
    out.put_u16_le(bytes.len() as u16);
    out.put_slice(bytes);
}

/// Opening message of each side: version, fresh nonce, suites and options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub version: u8,
    pub nonce: Nonce,
    pub cipher_suites: CipherSuites,
    pub options: ChannelOptions,
}

impl WireMessage for Hello {
    fn encode(&self, out: &mut BytesMut) {
        out.put_u8(StatusCode::Success.wire());
        out.put_u8(self.version);
        out.put_slice(&self.nonce);
        out.put_u8(self.cipher_suites.bits());
        out.put_u8(self.options.bits());
    }

    fn decode(src: &[u8]) -> Result<Option<(Self, usize)>> {
        let mut f = Fields::new(src);
        need!(f.status()?);
        let version = need!(f.u8());
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(need!(f.take(NONCE_LEN)));
        let cipher_suites = CipherSuites::from_bits(need!(f.u8()));
        let options = ChannelOptions::from_bits(need!(f.u8()));
        Ok(Some((
            Hello {
                version,
                nonce,
                cipher_suites,
                options,
            },
            f.pos,
        )))
    }
}

/// Ephemeral public key and, when required, the PSK tag over it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyExchange {
    pub ephemeral_public: Vec<u8>,
    /// Empty unless pre-shared key authentication is required.
    pub psk_tag: Vec<u8>,
}

impl WireMessage for KeyExchange {
    fn encode(&self, out: &mut BytesMut) {
        out.put_u8(StatusCode::Success.wire());
        put_field(out, &self.ephemeral_public);
        put_field(out, &self.psk_tag);
    }

    fn decode(src: &[u8]) -> Result<Option<(Self, usize)>> {
        let mut f = Fields::new(src);
        need!(f.status()?);
        let ephemeral_public = need!(f.field("ephemeral key")?).to_vec();
        let psk_tag = need!(f.field("PSK tag")?).to_vec();
        Ok(Some((
            KeyExchange {
                ephemeral_public,
                psk_tag,
            },
            f.pos,
        )))
    }
}

/// Proof of a long-term identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authentication {
    pub identity: Identity,
    pub public_key: Vec<u8>,
    /// Signature over `ephemeral_public || server_nonce || client_nonce`.
    pub signature: Vec<u8>,
}

impl WireMessage for Authentication {
    fn encode(&self, out: &mut BytesMut) {
        out.put_u8(StatusCode::Success.wire());
        out.put_slice(self.identity.as_bytes());
        put_field(out, &self.public_key);
        put_field(out, &self.signature);
    }

    fn decode(src: &[u8]) -> Result<Option<(Self, usize)>> {
        let mut f = Fields::new(src);
        need!(f.status()?);
        let identity = Identity::from_slice(need!(f.take(IDENTITY_LEN)))?;
        let public_key = need!(f.field("public key")?).to_vec();
        let signature = need!(f.field("signature")?).to_vec();
        Ok(Some((
            Authentication {
                identity,
                public_key,
                signature,
            },
            f.pos,
        )))
    }
}

/// A bare status byte. `Success` completes a handshake; anything else
/// reports a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusPacket(pub StatusCode);

impl WireMessage for StatusPacket {
    fn encode(&self, out: &mut BytesMut) {
        out.put_u8(self.0.wire());
    }

    fn decode(src: &[u8]) -> Result<Option<(Self, usize)>> {
        let mut f = Fields::new(src);
        need!(f.status()?);
        Ok(Some((StatusPacket(StatusCode::Success), f.pos)))
    }
}

/// Decode a message that must fill `payload` exactly, as inside one frame.
pub fn decode_exact<M: WireMessage>(payload: &[u8]) -> Result<M> {
    match M::decode(payload)? {
        Some((msg, used)) if used == payload.len() => Ok(msg),
        Some((_, used)) => Err(ChannelError::Malformed(format!(
            "{} trailing bytes after message",
            payload.len() - used
        ))),
        None => Err(ChannelError::Malformed("truncated message".into())),
    }
}

/// Encode a message into a fresh buffer.
pub fn encode_message<M: WireMessage>(msg: &M) -> BytesMut {
    let mut out = BytesMut::new();
    msg.encode(&mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use channeltrust::identity::generate_identity;

    #[test]
    fn hello_layout() {
        let hello = Hello {
            version: PROTOCOL_VERSION,
            nonce: [0x5A; 32],
            cipher_suites: CipherSuites::ALL,
            options: ChannelOptions::CLIENT_AUTHENTICATION_REQUIRED,
        };
        let bytes = encode_message(&hello);
        assert_eq!(bytes.len(), 36);
        assert_eq!(bytes[0], 0);
        assert_eq!(bytes[1], PROTOCOL_VERSION);
        assert_eq!(bytes[34], 0x0F);
        assert_eq!(bytes[35], 0x02);
        assert_eq!(decode_exact::<Hello>(&bytes).unwrap(), hello);
    }

    #[test]
    fn prefixes_need_more_bytes() {
        let kx = KeyExchange {
            ephemeral_public: vec![1; 32],
            psk_tag: vec![2; 32],
        };
        let bytes = encode_message(&kx);
        for cut in 0..bytes.len() {
            assert!(KeyExchange::decode(&bytes[..cut]).unwrap().is_none(), "cut {cut}");
        }
        let (decoded, used) = KeyExchange::decode(&bytes).unwrap().unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(decoded, kx);
    }

    #[test]
    fn decode_leaves_following_bytes() {
        let mut bytes = encode_message(&StatusPacket(StatusCode::Success));
        bytes.put_slice(b"next message");
        let (_, used) = StatusPacket::decode(&bytes).unwrap().unwrap();
        assert_eq!(used, 1);
    }

    #[test]
    fn nonzero_status_stops_decoding() {
        let err = Authentication::decode(&[StatusCode::PskAuthenticationFailed.wire()]).unwrap_err();
        assert!(matches!(
            err,
            ChannelError::RemoteStatus(StatusCode::PskAuthenticationFailed)
        ));
        let err = Hello::decode(&[0x77]).unwrap_err();
        assert!(matches!(err, ChannelError::RemoteStatus(StatusCode::UnknownException)));
    }

    #[test]
    fn oversize_field_rejected_before_body() {
        let mut bytes = BytesMut::new();
        bytes.put_u8(0);
        bytes.put_u16_le((MAX_FIELD_LEN + 1) as u16);
        assert!(matches!(
            KeyExchange::decode(&bytes),
            Err(ChannelError::Malformed(_))
        ));
    }

    #[test]
    fn trailing_bytes_rejected_in_frame() {
        let auth = Authentication {
            identity: generate_identity(b"pk"),
            public_key: b"pk".to_vec(),
            signature: vec![9; 64],
        };
        let mut bytes = encode_message(&auth);
        assert_eq!(decode_exact::<Authentication>(&bytes).unwrap(), auth);
        bytes.put_u8(0);
        assert!(decode_exact::<Authentication>(&bytes).is_err());
        assert!(decode_exact::<Authentication>(&bytes[..10]).is_err());
    }
}
