// Encrypt-then-MAC frame protection: AES-256-CBC + HMAC-SHA256.
//
// Plaintext frame:   len u16 LE | flags u8 | payload | random padding
// Wire frame:        CBC(plaintext frame) | HMAC-SHA256(ciphertext)
//
// `len` counts header and payload. The padding length is implied by rounding
// up to the block size. CBC chaining continues across the frames of one
// direction, so frames must be opened in the order they were sealed.

use aes::Aes256;
use bytes::{BufMut, BytesMut};
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crate::crypto::kdf::{MasterKey, IV_LEN};
use crate::error::{Result, TrustError};

type HmacSha256 = Hmac<Sha256>;

pub const BLOCK_SIZE: usize = 16;
pub const MAC_SIZE: usize = 32;
pub const HEADER_SIZE: usize = 3;
/// Largest plaintext frame: a whole number of blocks that fits the u16 length.
pub const MAX_PACKET_SIZE: usize = 65520;
pub const MAX_PAYLOAD_SIZE: usize = MAX_PACKET_SIZE - HEADER_SIZE;

/// Frame flag values.
pub const FLAG_DATA: u8 = 0;
pub const FLAG_RENEGOTIATE: u8 = 1;
pub const FLAG_CLOSE_CHANNEL: u8 = 2;

fn padded_len(len: usize) -> usize {
    len.div_ceil(BLOCK_SIZE) * BLOCK_SIZE
}

/// Total wire size of a frame carrying `payload_len` bytes.
pub fn sealed_len(payload_len: usize) -> usize {
    padded_len(HEADER_SIZE + payload_len) + MAC_SIZE
}

/// Seals outgoing frames for one direction of a session.
#[derive(Clone)]
pub struct FrameSealer {
    cipher: cbc::Encryptor<Aes256>,
    mac: HmacSha256,
}

impl FrameSealer {
    pub fn new(key: &MasterKey, iv: &[u8; IV_LEN]) -> Result<Self> {
        let cipher = cbc::Encryptor::<Aes256>::new_from_slices(key.as_bytes(), iv)
            .map_err(|e| TrustError::CipherInit(format!("AES-256-CBC: {e}")))?;
        let mac = <HmacSha256 as Mac>::new_from_slice(key.as_bytes())
            .map_err(|e| TrustError::CipherInit(format!("HMAC-SHA256: {e}")))?;
        Ok(Self { cipher, mac })
    }

    /// Append one sealed frame to `out`.
    pub fn seal(&mut self, flags: u8, payload: &[u8], out: &mut BytesMut) -> Result<()> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(TrustError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let len = HEADER_SIZE + payload.len();
        let padded = padded_len(len);

        let start = out.len();
        out.reserve(padded + MAC_SIZE);
        out.put_u16_le(len as u16);
        out.put_u8(flags);
        out.put_slice(payload);
        let mut padding = [0u8; BLOCK_SIZE];
        rand::thread_rng().fill_bytes(&mut padding[..padded - len]);
        out.put_slice(&padding[..padded - len]);

        for chunk in out[start..].chunks_exact_mut(BLOCK_SIZE) {
            self.cipher
                .encrypt_block_mut(aes::Block::from_mut_slice(chunk));
        }

        let mut mac = self.mac.clone();
        mac.update(&out[start..]);
        out.put_slice(&mac.finalize().into_bytes());
        Ok(())
    }
}

/// Opens incoming frames for one direction of a session.
#[derive(Clone)]
pub struct FrameOpener {
    cipher: cbc::Decryptor<Aes256>,
    mac: HmacSha256,
}

impl FrameOpener {
    pub fn new(key: &MasterKey, iv: &[u8; IV_LEN]) -> Result<Self> {
        let cipher = cbc::Decryptor::<Aes256>::new_from_slices(key.as_bytes(), iv)
            .map_err(|e| TrustError::CipherInit(format!("AES-256-CBC: {e}")))?;
        let mac = <HmacSha256 as Mac>::new_from_slice(key.as_bytes())
            .map_err(|e| TrustError::CipherInit(format!("HMAC-SHA256: {e}")))?;
        Ok(Self { cipher, mac })
    }

    /// Wire size of the frame whose first ciphertext block is `first_block`.
    ///
    /// Decrypts a copy of the block without advancing the chain. A length the
    /// sender could never have produced means the block was tampered with.
    pub fn frame_len(&self, first_block: &[u8]) -> Result<usize> {
        if first_block.len() < BLOCK_SIZE {
            return Err(TrustError::MessageAuthentication);
        }
        let mut block = aes::Block::clone_from_slice(&first_block[..BLOCK_SIZE]);
        self.cipher.clone().decrypt_block_mut(&mut block);

        let len = u16::from_le_bytes([block[0], block[1]]) as usize;
        if !(HEADER_SIZE..=MAX_PACKET_SIZE).contains(&len) {
            return Err(TrustError::MessageAuthentication);
        }
        Ok(padded_len(len) + MAC_SIZE)
    }

    /// Authenticate and decrypt one whole wire frame in place.
    ///
    /// The MAC is checked before anything is decrypted. Returns the flags
    /// byte and the payload.
    pub fn open<'a>(&mut self, frame: &'a mut [u8]) -> Result<(u8, &'a [u8])> {
        if frame.len() < BLOCK_SIZE + MAC_SIZE || (frame.len() - MAC_SIZE) % BLOCK_SIZE != 0 {
            return Err(TrustError::MessageAuthentication);
        }
        let (ciphertext, tag) = frame.split_at_mut(frame.len() - MAC_SIZE);

        let mut mac = self.mac.clone();
        mac.update(ciphertext);
        mac.verify_slice(tag)
            .map_err(|_| TrustError::MessageAuthentication)?;

        for chunk in ciphertext.chunks_exact_mut(BLOCK_SIZE) {
            self.cipher
                .decrypt_block_mut(aes::Block::from_mut_slice(chunk));
        }

        let len = u16::from_le_bytes([ciphertext[0], ciphertext[1]]) as usize;
        if len < HEADER_SIZE || padded_len(len) != ciphertext.len() {
            return Err(TrustError::MessageAuthentication);
        }
        let flags = ciphertext[2];
        let plaintext: &'a [u8] = ciphertext;
        Ok((flags, &plaintext[HEADER_SIZE..len]))
    }
}

/// Build the sealer/opener pair for one side of a session.
///
/// `write_iv` is derived from this side's nonce, `read_iv` from the peer's.
pub fn session_ciphers(
    key: &MasterKey,
    write_iv: &[u8; IV_LEN],
    read_iv: &[u8; IV_LEN],
) -> Result<(FrameSealer, FrameOpener)> {
    Ok((FrameSealer::new(key, write_iv)?, FrameOpener::new(key, read_iv)?))
}
