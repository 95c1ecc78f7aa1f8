//! The public secure channel handle.
//!
//! A [`SecureChannel`] wraps any ordered byte transport. It is cheap to
//! clone, and clones may read, write and renegotiate from different tasks at
//! the same time: the read side and the write side sit behind independent
//! locks, and renegotiation hands the write side between them explicitly
//! (see [`crate::renegotiation`]).

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use channeltrust::{CipherSuite, Identity, StatusCode, TrustError};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::{ChannelConfig, Credentials, Role};
use crate::error::{ChannelError, Result, SecureChannelError};
use crate::frame::FrameKind;
use crate::handshake::{self, HandshakeContext, HandshakeOutcome};
use crate::renegotiation::{spawn_timer, Coordinator};
use crate::session::{ReadSide, SessionInfo, SessionStats, WriteSide};

/// An ordered byte transport a channel can run over.
pub trait Transport: AsyncRead + AsyncWrite + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + 'static> Transport for T {}

pub(crate) type Reader<T> = ReadSide<ReadHalf<T>>;
pub(crate) type Writer<T> = WriteSide<WriteHalf<T>>;

pub(crate) struct Inner<T> {
    pub(crate) role: Role,
    pub(crate) config: ChannelConfig,
    pub(crate) credentials: Credentials,
    pub(crate) remote: Option<SocketAddr>,
    pub(crate) read: Arc<AsyncMutex<Reader<T>>>,
    pub(crate) write: Arc<AsyncMutex<Writer<T>>>,
    pub(crate) coordinator: Coordinator<WriteHalf<T>>,
    pub(crate) stats: Arc<SessionStats>,
    session: Mutex<SessionInfo>,
    poisoned: Mutex<Option<SecureChannelError>>,
    closed: AtomicBool,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl<T> Inner<T> {
    pub(crate) fn peer_identity(&self) -> Option<Identity> {
        self.session.lock().peer_identity
    }

    /// Closed locally or failed beyond recovery.
    pub(crate) fn is_finished(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.poisoned.lock().is_some()
    }

    fn check_poisoned(&self) -> Result<()> {
        match &*self.poisoned.lock() {
            Some(err) => Err(ChannelError::Secure(err.clone())),
            None => Ok(()),
        }
    }

    /// Fail if the channel can no longer send.
    pub(crate) fn check_usable(&self) -> Result<()> {
        self.check_poisoned()?;
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        Ok(())
    }

    /// Mark the channel unusable. The first failure wins.
    pub(crate) fn poison(&self, err: SecureChannelError) {
        let mut poisoned = self.poisoned.lock();
        if poisoned.is_none() {
            tracing::warn!(role = %self.role, error = %err, "secure channel poisoned");
            *poisoned = Some(err);
        }
    }

    /// Record a completed renegotiation.
    pub(crate) fn record_session(&self, outcome: HandshakeOutcome) {
        let mut session = self.session.lock();
        session.generation += 1;
        session.cipher_suite = outcome.cipher_suite;
        session.key_id = outcome.key_id;
        session.peer_identity = outcome.peer_identity.or(session.peer_identity);
    }

    fn stop_timer(&self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
    }
}

impl<T: Transport> Inner<T> {
    async fn read_some(&self, buf: &mut [u8]) -> Result<usize> {
        let mut read = self.read.lock().await;
        loop {
            self.check_poisoned()?;
            if read.has_buffered() {
                return Ok(read.take_buffered(buf));
            }
            if read.is_closed() {
                return Ok(0);
            }
            // Only the wait for the next frame is bounded; a frame that has
            // arrived is always processed to completion.
            let frame = match timeout(self.config.read_timeout, read.next_frame()).await {
                Ok(Ok(frame)) => frame,
                Ok(Err(err)) => return Err(self.read_failure(err)),
                Err(_) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out").into())
                }
            };
            match frame.kind {
                FrameKind::Data => read.buffer_data(&frame.payload),
                FrameKind::CloseChannel => {
                    tracing::debug!(role = %self.role, "peer closed the channel");
                    read.mark_closed();
                }
                FrameKind::Renegotiate => self.respond_to_renegotiation(&mut read).await?,
            }
        }
    }

    /// A frame that fails authentication ends the channel. Nothing is sent
    /// to the peer.
    fn read_failure(&self, err: ChannelError) -> ChannelError {
        match err {
            ChannelError::Trust(TrustError::MessageAuthentication) => {
                let err = SecureChannelError::new(
                    StatusCode::MessageAuthenticationFailed,
                    "received frame failed authentication",
                )
                .with_endpoint(self.remote)
                .with_peer_identity(self.peer_identity());
                self.poison(err.clone());
                ChannelError::Secure(err)
            }
            other => other,
        }
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        self.stop_timer();
    }
}

/// An encrypted, optionally authenticated channel over a byte transport.
pub struct SecureChannel<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for SecureChannel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport> SecureChannel<T> {
    /// Run the client handshake over `transport`.
    pub async fn client(
        transport: T,
        remote: Option<SocketAddr>,
        config: ChannelConfig,
        credentials: Credentials,
    ) -> Result<Self> {
        Self::establish(Role::Client, transport, remote, config, credentials).await
    }

    /// Run the server handshake over `transport`.
    pub async fn server(
        transport: T,
        remote: Option<SocketAddr>,
        config: ChannelConfig,
        credentials: Credentials,
    ) -> Result<Self> {
        Self::establish(Role::Server, transport, remote, config, credentials).await
    }

    async fn establish(
        role: Role,
        transport: T,
        remote: Option<SocketAddr>,
        config: ChannelConfig,
        credentials: Credentials,
    ) -> Result<Self> {
        config.validate(role, &credentials)?;

        let (r, w) = tokio::io::split(transport);
        let stats = Arc::new(SessionStats::new());
        let mut read = ReadSide::new(r);
        let mut write = WriteSide::new(w, stats.clone());

        let ctx = HandshakeContext {
            role,
            config: &config,
            credentials: &credentials,
            remote,
            pinned_identity: None,
            renegotiation: false,
        };
        let outcome = match timeout(config.read_timeout, handshake::run(&mut read, &mut write, &ctx)).await {
            Ok(outcome) => outcome?,
            Err(_) => {
                tracing::warn!(%role, ?remote, "initial handshake timed out");
                return Err(io::Error::new(io::ErrorKind::TimedOut, "handshake timed out").into());
            }
        };

        let inner = Arc::new(Inner {
            role,
            config,
            credentials,
            remote,
            read: Arc::new(AsyncMutex::new(read)),
            write: Arc::new(AsyncMutex::new(write)),
            coordinator: Coordinator::new(),
            stats,
            session: Mutex::new(SessionInfo {
                cipher_suite: outcome.cipher_suite,
                generation: 0,
                key_id: outcome.key_id,
                peer_identity: outcome.peer_identity,
            }),
            poisoned: Mutex::new(None),
            closed: AtomicBool::new(false),
            timer: Mutex::new(None),
        });
        let timer = spawn_timer(&inner);
        *inner.timer.lock() = timer;
        Ok(Self { inner })
    }

    /// Read application data into `buf`.
    ///
    /// Returns 0 once the peer has closed the channel. A read that waits
    /// longer than the configured timeout fails with
    /// [`io::ErrorKind::TimedOut`] and leaves the channel usable.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.inner.read_some(buf).await
    }

    /// Fill `buf` completely.
    pub async fn read_exact(&self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "channel closed before buffer was filled",
                )
                .into());
            }
            filled += n;
        }
        Ok(())
    }

    /// Buffer application data. Full frames are sent as they fill; call
    /// [`flush`](Self::flush) to send the rest.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        self.inner.check_usable()?;
        let mut write = self.inner.write.lock().await;
        self.inner.check_usable()?;
        write.write(data).await
    }

    /// Send any buffered application data.
    pub async fn flush(&self) -> Result<()> {
        self.inner.check_usable()?;
        let mut write = self.inner.write.lock().await;
        self.inner.check_usable()?;
        write.flush().await
    }

    /// Re-key the channel with a fresh handshake.
    ///
    /// The peer processes the request on its read path, so it must have a
    /// reader active. Failure leaves the channel unusable.
    pub async fn renegotiate(&self) -> Result<()> {
        self.inner.renegotiate().await
    }

    /// Flush, tell the peer no more data follows, and shut the transport's
    /// write half. Reads continue until the peer closes too.
    pub async fn close(&self) -> Result<()> {
        self.inner.check_poisoned()?;
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.stop_timer();
        // An aborted timer can leave its write side parked in the hand-off.
        let mut slot = self.inner.coordinator.slot.lock().await;
        slot.take();
        let mut write = self.inner.write.lock().await;
        drop(slot);
        write.flush().await?;
        write.send_control(FrameKind::CloseChannel).await?;
        write.shutdown().await?;
        tracing::debug!(role = %self.inner.role, "channel closed");
        Ok(())
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn cipher_suite(&self) -> CipherSuite {
        self.inner.session.lock().cipher_suite
    }

    /// The authenticated peer identity, if the suite carried one.
    pub fn peer_identity(&self) -> Option<Identity> {
        self.inner.peer_identity()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote
    }

    pub fn session_info(&self) -> SessionInfo {
        self.inner.session.lock().clone()
    }

    /// Wire bytes sent under the current session.
    pub fn bytes_sent(&self) -> u64 {
        self.inner.stats.bytes_sent()
    }

    pub fn session_age(&self) -> Duration {
        self.inner.stats.age()
    }

    /// The failure that made this channel unusable, if any.
    pub fn failure(&self) -> Option<SecureChannelError> {
        self.inner.poisoned.lock().clone()
    }
}
