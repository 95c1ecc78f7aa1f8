//! Cipher session: the framed read and write sides of a channel.
//!
//! Each side is owned by one task at a time (behind its own lock in the
//! channel). Before the first handshake installs keys, messages travel as
//! raw bytes; afterwards every byte on the wire belongs to a sealed frame.
//!
//! The read side keeps undelivered ciphertext in `inbound`, so a read
//! abandoned by a timeout never loses part of a frame.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use channeltrust::crypto::cipher::{
    FrameOpener, FrameSealer, BLOCK_SIZE, FLAG_DATA, HEADER_SIZE, MAX_PAYLOAD_SIZE,
};
use channeltrust::{CipherSuite, Identity, StatusCode};

use crate::error::{ChannelError, Result};
use crate::frame::{Frame, FrameKind};
use crate::message::{decode_exact, encode_message, StatusPacket, WireMessage};

/// Traffic counters for the current session, read by the renegotiation timer.
#[derive(Debug)]
pub struct SessionStats {
    bytes_sent: AtomicU64,
    established_at: Mutex<Instant>,
}

impl SessionStats {
    pub fn new() -> Self {
        Self {
            bytes_sent: AtomicU64::new(0),
            established_at: Mutex::new(Instant::now()),
        }
    }

    /// Wire bytes sent since the current session was established.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Time since the current session was established.
    pub fn age(&self) -> Duration {
        self.established_at.lock().elapsed()
    }

    pub(crate) fn record_sent(&self, n: usize) {
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Start counting for a freshly installed session.
    pub(crate) fn reset(&self) {
        self.bytes_sent.store(0, Ordering::Relaxed);
        *self.established_at.lock() = Instant::now();
    }
}

impl Default for SessionStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Description of the session currently protecting the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub cipher_suite: CipherSuite,
    /// 0 for the initial handshake, incremented by each renegotiation.
    pub generation: u64,
    /// Non-secret fingerprint of the master key.
    pub key_id: [u8; 8],
    pub peer_identity: Option<Identity>,
}

/// Inbound half: frame parsing, verification and buffered application data.
pub struct ReadSide<R> {
    transport: R,
    opener: Option<FrameOpener>,
    /// Bytes read from the transport but not yet consumed.
    inbound: BytesMut,
    /// Verified application data not yet handed to a reader.
    plain: BytesMut,
    closed: bool,
}

impl<R: AsyncRead + Unpin> ReadSide<R> {
    pub fn new(transport: R) -> Self {
        Self {
            transport,
            opener: None,
            inbound: BytesMut::with_capacity(8 * 1024),
            plain: BytesMut::new(),
            closed: false,
        }
    }

    /// Switch reads to a new session.
    pub fn install(&mut self, opener: FrameOpener) {
        self.opener = Some(opener);
    }

    pub fn is_encrypted(&self) -> bool {
        self.opener.is_some()
    }

    /// Read from the transport until `inbound` holds at least `n` bytes.
    async fn fill(&mut self, n: usize) -> Result<()> {
        while self.inbound.len() < n {
            self.inbound.reserve(n - self.inbound.len());
            if self.transport.read_buf(&mut self.inbound).await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "transport closed by peer",
                )
                .into());
            }
        }
        Ok(())
    }

    /// Read, authenticate and decrypt the next frame.
    ///
    /// Cancel-safe: if the future is dropped before it completes, no bytes
    /// are lost and the next call resumes with the same frame.
    pub async fn next_frame(&mut self) -> Result<Frame> {
        if self.opener.is_none() {
            return Err(ChannelError::NotEstablished);
        }
        self.fill(BLOCK_SIZE).await?;
        let opener = self.opener.as_ref().ok_or(ChannelError::NotEstablished)?;
        let total = opener.frame_len(&self.inbound[..BLOCK_SIZE])?;
        self.fill(total).await?;

        let mut sealed = self.inbound.split_to(total);
        let opener = self.opener.as_mut().ok_or(ChannelError::NotEstablished)?;
        let (flags, payload_len) = {
            let (flags, payload) = opener.open(&mut sealed)?;
            (flags, payload.len())
        };
        sealed.truncate(HEADER_SIZE + payload_len);
        sealed.advance(HEADER_SIZE);
        Ok(Frame {
            kind: FrameKind::from(flags),
            payload: sealed.freeze(),
        })
    }

    /// Receive one handshake message.
    ///
    /// Raw before encryption is enabled; afterwards each message is exactly
    /// one data frame.
    pub async fn read_message<M: WireMessage>(&mut self) -> Result<M> {
        if self.opener.is_none() {
            loop {
                if let Some((msg, used)) = M::decode(&self.inbound)? {
                    self.inbound.advance(used);
                    return Ok(msg);
                }
                let need = self.inbound.len() + 1;
                self.fill(need).await?;
            }
        }
        let frame = self.next_frame().await?;
        match frame.kind {
            FrameKind::Data => decode_exact(&frame.payload),
            FrameKind::CloseChannel => {
                self.closed = true;
                Err(ChannelError::Closed)
            }
            FrameKind::Renegotiate => Err(ChannelError::Malformed(
                "renegotiation request inside a handshake".into(),
            )),
        }
    }

    /// Queue verified application data for the reader.
    pub fn buffer_data(&mut self, payload: &[u8]) {
        self.plain.extend_from_slice(payload);
    }

    pub fn has_buffered(&self) -> bool {
        !self.plain.is_empty()
    }

    /// Move buffered application data into `buf`.
    pub fn take_buffered(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.plain.len());
        self.plain.copy_to_slice(&mut buf[..n]);
        n
    }

    /// The peer sent CLOSE_CHANNEL.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn mark_closed(&mut self) {
        self.closed = true;
    }
}

/// Outbound half: buffers application data and emits sealed frames.
pub struct WriteSide<W> {
    transport: W,
    sealer: Option<FrameSealer>,
    /// Application data not yet framed.
    pending: BytesMut,
    /// Scratch space for sealed frames.
    outbound: BytesMut,
    stats: Arc<SessionStats>,
}

impl<W: AsyncWrite + Unpin> WriteSide<W> {
    pub fn new(transport: W, stats: Arc<SessionStats>) -> Self {
        Self {
            transport,
            sealer: None,
            pending: BytesMut::new(),
            outbound: BytesMut::new(),
            stats,
        }
    }

    /// Switch writes to a new session.
    pub fn install(&mut self, sealer: FrameSealer) {
        self.sealer = Some(sealer);
    }

    pub fn is_encrypted(&self) -> bool {
        self.sealer.is_some()
    }

    pub fn stats(&self) -> &Arc<SessionStats> {
        &self.stats
    }

    /// Buffer application data, emitting a frame whenever the buffer fills.
    pub async fn write(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let room = MAX_PAYLOAD_SIZE - self.pending.len();
            let n = room.min(data.len());
            self.pending.extend_from_slice(&data[..n]);
            data = &data[n..];
            if self.pending.len() == MAX_PAYLOAD_SIZE {
                self.emit_pending().await?;
            }
        }
        Ok(())
    }

    async fn emit_pending(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let payload = self.pending.split();
        self.write_frame(FLAG_DATA, &payload).await
    }

    /// Emit buffered data and flush the transport. A no-op when nothing is
    /// buffered.
    pub async fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.emit_pending().await?;
        self.transport.flush().await?;
        Ok(())
    }

    async fn write_frame(&mut self, flags: u8, payload: &[u8]) -> Result<()> {
        let sealer = self.sealer.as_mut().ok_or(ChannelError::NotEstablished)?;
        self.outbound.clear();
        sealer.seal(flags, payload, &mut self.outbound)?;
        self.transport.write_all(&self.outbound).await?;
        self.stats.record_sent(self.outbound.len());
        Ok(())
    }

    /// Send an empty frame carrying a control flag.
    pub async fn send_control(&mut self, kind: FrameKind) -> Result<()> {
        self.write_frame(kind.flags(), &[]).await?;
        self.transport.flush().await?;
        Ok(())
    }

    /// Send one handshake message, raw or as a single sealed frame.
    pub async fn send_message<M: WireMessage>(&mut self, msg: &M) -> Result<()> {
        let encoded = encode_message(msg);
        if self.sealer.is_some() {
            self.write_frame(FLAG_DATA, &encoded).await?;
        } else {
            self.transport.write_all(&encoded).await?;
        }
        self.transport.flush().await?;
        Ok(())
    }

    pub async fn send_status(&mut self, code: StatusCode) -> Result<()> {
        self.send_message(&StatusPacket(code)).await
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.transport.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use channeltrust::crypto::kdf::MasterKey;
    use tokio::io::duplex;

    fn keyed_pair<R, W>(read: &mut ReadSide<R>, write: &mut WriteSide<W>)
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let key = MasterKey::from_bytes([3; 32]);
        let iv = [4; 16];
        write.install(FrameSealer::new(&key, &iv).unwrap());
        read.install(FrameOpener::new(&key, &iv).unwrap());
    }

    #[tokio::test]
    async fn large_write_is_split_into_full_frames() {
        let (a, b) = duplex(1 << 20);
        let stats = Arc::new(SessionStats::new());
        let mut write = WriteSide::new(a, stats.clone());
        let mut read = ReadSide::new(b);
        keyed_pair(&mut read, &mut write);

        let data: Vec<u8> = (0..MAX_PAYLOAD_SIZE * 2 + 10).map(|i| i as u8).collect();
        write.write(&data).await.unwrap();
        write.flush().await.unwrap();

        let mut received = Vec::new();
        let mut sizes = Vec::new();
        while received.len() < data.len() {
            let frame = read.next_frame().await.unwrap();
            assert_eq!(frame.kind, FrameKind::Data);
            sizes.push(frame.payload.len());
            received.extend_from_slice(&frame.payload);
        }
        assert_eq!(sizes, vec![MAX_PAYLOAD_SIZE, MAX_PAYLOAD_SIZE, 10]);
        assert_eq!(received, data);
        assert!(stats.bytes_sent() > data.len() as u64);
    }

    #[tokio::test]
    async fn empty_flush_sends_nothing() {
        let (a, _b) = duplex(1024);
        let stats = Arc::new(SessionStats::new());
        let mut write = WriteSide::new(a, stats.clone());
        let key = MasterKey::from_bytes([3; 32]);
        write.install(FrameSealer::new(&key, &[4; 16]).unwrap());
        write.flush().await.unwrap();
        assert_eq!(stats.bytes_sent(), 0);
    }

    #[tokio::test]
    async fn raw_messages_leave_following_bytes_buffered() {
        let (mut a, b) = duplex(1024);
        let mut read = ReadSide::new(b);
        let mut bytes = encode_message(&StatusPacket(StatusCode::Success));
        bytes.extend_from_slice(&[0u8; 5]);
        a.write_all(&bytes).await.unwrap();

        let status: StatusPacket = read.read_message().await.unwrap();
        assert_eq!(status, StatusPacket(StatusCode::Success));
        assert_eq!(read.inbound.len(), 5);
    }

    #[tokio::test]
    async fn eof_mid_frame_is_an_io_error() {
        let (mut a, b) = duplex(1024);
        let mut read = ReadSide::new(b);
        let key = MasterKey::from_bytes([3; 32]);
        read.install(FrameOpener::new(&key, &[4; 16]).unwrap());
        a.write_all(&[0u8; 7]).await.unwrap();
        drop(a);
        assert!(matches!(read.next_frame().await, Err(ChannelError::Io(_))));
    }

    #[test]
    fn stats_reset() {
        let stats = SessionStats::new();
        stats.record_sent(500);
        assert_eq!(stats.bytes_sent(), 500);
        stats.reset();
        assert_eq!(stats.bytes_sent(), 0);
        assert!(stats.age() < Duration::from_secs(5));
    }
}
