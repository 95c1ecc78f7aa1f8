//! Renegotiation: re-running the handshake under a live channel.
//!
//! The initiator flushes, sends a RENEGOTIATE frame and parks its write side
//! in a single-slot hand-off. Whoever next sees a RENEGOTIATE frame on the
//! read side treats it as the echo and runs the handshake with the parked
//! write side:
//!
//! * a reader task already blocked in `read`, which then reports the result
//!   through the hand-off's completion channel, or
//! * the initiator itself, once the read side is free, buffering any data
//!   frames that arrive before the echo.
//!
//! A RENEGOTIATE seen with nothing parked is a request from the peer: the
//! reader takes the write side, flushes, echoes and runs the handshake.
//! Because both ends echo exactly once, simultaneous requests resolve into a
//! single handshake.
//!
//! Locks are always taken in the order serial, slot, write, read.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::oneshot::{self, error::RecvError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};

use channeltrust::StatusCode;

use crate::channel::{Inner, Reader, Transport, Writer};
use crate::error::{ChannelError, Result, SecureChannelError};
use crate::frame::FrameKind;
use crate::handshake::{self, HandshakeContext};
use crate::session::WriteSide;

type Completion = std::result::Result<(), SecureChannelError>;

/// A parked write side waiting for the echo.
pub(crate) struct Handoff<W> {
    write: OwnedMutexGuard<WriteSide<W>>,
    done: oneshot::Sender<Completion>,
}

pub(crate) struct Coordinator<W> {
    /// One initiator at a time.
    serial: AsyncMutex<()>,
    pub(crate) slot: AsyncMutex<Option<Handoff<W>>>,
}

impl<W> Coordinator<W> {
    pub(crate) fn new() -> Self {
        Self {
            serial: AsyncMutex::new(()),
            slot: AsyncMutex::new(None),
        }
    }
}

/// What woke a waiting initiator.
enum Wake<G> {
    Done(std::result::Result<Completion, RecvError>),
    ReadSide(G),
}

fn completed(result: std::result::Result<Completion, RecvError>) -> Completion {
    result.unwrap_or_else(|_| {
        Err(SecureChannelError::new(
            StatusCode::RenegotiationFailed,
            "renegotiation abandoned before completion",
        ))
    })
}

impl<T: Transport> Inner<T> {
    /// Initiate a renegotiation and wait for it to finish.
    ///
    /// The whole wait is bounded by the read timeout. Any failure poisons
    /// the channel.
    pub(crate) async fn renegotiate(&self) -> Result<()> {
        self.check_usable()?;
        let _serial = self.coordinator.serial.lock().await;
        self.check_usable()?;

        match timeout(self.config.read_timeout, self.initiate()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                self.poison(err.clone());
                Err(ChannelError::Secure(err))
            }
            Err(_) => {
                let err = self.timed_out("peer did not answer the renegotiation request in time");
                self.coordinator.slot.lock().await.take();
                self.poison(err.clone());
                Err(ChannelError::Secure(err))
            }
        }
    }

    async fn initiate(&self) -> Completion {
        let (done_tx, mut done_rx) = oneshot::channel();
        {
            let mut slot = self.coordinator.slot.lock().await;
            let mut write = self.write.clone().lock_owned().await;
            write
                .flush()
                .await
                .map_err(|e| self.renegotiation_failure(e))?;
            write
                .send_control(FrameKind::Renegotiate)
                .await
                .map_err(|e| self.renegotiation_failure(e))?;
            tracing::debug!(role = %self.role, "renegotiation requested");
            *slot = Some(Handoff {
                write,
                done: done_tx,
            });
        }

        let woke = tokio::select! {
            result = &mut done_rx => Wake::Done(result),
            read = self.read.clone().lock_owned() => Wake::ReadSide(read),
        };
        match woke {
            Wake::Done(result) => completed(result),
            Wake::ReadSide(mut read) => {
                let parked = self.coordinator.slot.lock().await.take();
                match parked {
                    Some(handoff) => self.finish_as_initiator(&mut read, handoff).await,
                    // A reader already took the hand-off and has finished.
                    None => {
                        drop(read);
                        completed(done_rx.await)
                    }
                }
            }
        }
    }

    /// Read until the peer's echo, then run the handshake.
    async fn finish_as_initiator(
        &self,
        read: &mut Reader<T>,
        handoff: Handoff<tokio::io::WriteHalf<T>>,
    ) -> Completion {
        let Handoff { mut write, done } = handoff;
        drop(done);
        loop {
            let frame = read
                .next_frame()
                .await
                .map_err(|e| self.renegotiation_failure(e))?;
            match frame.kind {
                FrameKind::Data => read.buffer_data(&frame.payload),
                FrameKind::Renegotiate => break,
                FrameKind::CloseChannel => {
                    read.mark_closed();
                    return Err(self.renegotiation_failure(ChannelError::Closed));
                }
            }
        }
        self.rehandshake(read, &mut write).await
    }

    /// Handle a RENEGOTIATE frame seen on the read path.
    ///
    /// The handshake that follows is bounded by the read timeout. Expiry
    /// fails with `RenegotiationFailed` and poisons the channel.
    pub(crate) async fn respond_to_renegotiation(&self, read: &mut Reader<T>) -> Result<()> {
        let mut slot = self.coordinator.slot.lock().await;
        let parked = slot.take();
        let result = match parked {
            Some(Handoff { mut write, done }) => {
                drop(slot);
                tracing::debug!(role = %self.role, "renegotiation echo received");
                let result = self.bounded(self.rehandshake(read, &mut write)).await;
                drop(write);
                let _ = done.send(result.clone());
                result
            }
            None => {
                let respond = async move {
                    let mut write = self.write.lock().await;
                    drop(slot);
                    tracing::debug!(role = %self.role, "renegotiation requested by peer");
                    match echo(&mut *write).await {
                        Ok(()) => self.rehandshake(read, &mut write).await,
                        Err(err) => Err(self.renegotiation_failure(err)),
                    }
                };
                self.bounded(respond).await
            }
        };
        result.map_err(|err| {
            self.poison(err.clone());
            ChannelError::Secure(err)
        })
    }

    async fn bounded(&self, work: impl Future<Output = Completion>) -> Completion {
        match timeout(self.config.read_timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(self.timed_out("renegotiation handshake did not complete in time")),
        }
    }

    fn timed_out(&self, reason: &str) -> SecureChannelError {
        SecureChannelError::new(StatusCode::RenegotiationFailed, reason)
            .with_endpoint(self.remote)
            .with_peer_identity(self.peer_identity())
    }

    async fn rehandshake(&self, read: &mut Reader<T>, write: &mut Writer<T>) -> Completion {
        let pinned_identity = self.peer_identity();
        let ctx = HandshakeContext {
            role: self.role,
            config: &self.config,
            credentials: &self.credentials,
            remote: self.remote,
            pinned_identity,
            renegotiation: true,
        };
        match handshake::run(read, write, &ctx).await {
            Ok(outcome) => {
                self.record_session(outcome);
                Ok(())
            }
            Err(err) => Err(self.renegotiation_failure(err)),
        }
    }

    fn renegotiation_failure(&self, err: ChannelError) -> SecureChannelError {
        let err = match err {
            ChannelError::Secure(err) => err,
            other if other.is_transport() => {
                SecureChannelError::new(StatusCode::RenegotiationFailed, other.to_string())
            }
            other => other.into_secure(),
        };
        err.with_endpoint(self.remote)
            .with_peer_identity(self.peer_identity())
    }
}

async fn echo<W: tokio::io::AsyncWrite + Unpin>(write: &mut WriteSide<W>) -> Result<()> {
    write.flush().await?;
    write.send_control(FrameKind::Renegotiate).await
}

/// Start the background task that re-keys the channel when the configured
/// byte count or session age is exceeded.
///
/// The task holds only a weak reference and ends with the channel.
pub(crate) fn spawn_timer<T: Transport>(inner: &Arc<Inner<T>>) -> Option<JoinHandle<()>> {
    let policy = inner.config.renegotiation.clone();
    if !policy.is_enabled() {
        return None;
    }
    let weak = Arc::downgrade(inner);
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(policy.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(inner) = weak.upgrade() else {
                break;
            };
            if inner.is_finished() {
                break;
            }
            let bytes_sent = inner.stats.bytes_sent();
            let age = inner.stats.age();
            if !policy.is_due(bytes_sent, age) {
                continue;
            }
            tracing::debug!(
                role = %inner.role,
                bytes_sent,
                age_ms = age.as_millis() as u64,
                "renegotiation threshold reached"
            );
            if let Err(err) = inner.renegotiate().await {
                tracing::warn!(error = %err, "scheduled renegotiation failed");
                break;
            }
        }
    }))
}
