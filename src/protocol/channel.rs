//! # Channel
//!
//! The live, authenticated link between coordinator and master after a
//! completed handshake. A reader task answers pings and queues messages;
//! a writer task serializes outbound frames. Either side closing, or the
//! connection dropping, closes the channel for every clone.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use super::errors::{ProtocolError, ProtocolResult};
use super::frame::{read_frame, write_frame, Frame};
use super::identity::PeerIdentity;
use crate::master::Organization;

const INBOUND_BUFFER: usize = 64;

struct ChannelInner {
    id: Uuid,
    organization: Organization,
    peer: PeerIdentity,
    remote: String,
    opened_at: DateTime<Utc>,
    outbound: mpsc::UnboundedSender<Frame>,
    inbound: Mutex<mpsc::Receiver<serde_json::Value>>,
    closed: watch::Sender<Option<String>>,
    dropped: AtomicU64,
}

/// Cloneable handle to a live link.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("organization", &self.inner.organization)
            .field("remote", &self.inner.remote)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Channel {
    /// Take over a stream whose handshake has completed.
    ///
    /// `organization` is the peer's organization.
    pub fn spawn<S>(
        stream: S,
        id: Uuid,
        organization: Organization,
        peer: PeerIdentity,
        remote: impl Into<String>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::channel(INBOUND_BUFFER);
        let (closed_tx, _) = watch::channel(None);

        let channel = Self {
            inner: Arc::new(ChannelInner {
                id,
                organization,
                peer,
                remote: remote.into(),
                opened_at: Utc::now(),
                outbound: out_tx,
                inbound: Mutex::new(in_rx),
                closed: closed_tx,
                dropped: AtomicU64::new(0),
            }),
        };

        tokio::spawn(write_loop(writer, out_rx, channel.inner.closed.subscribe()));
        tokio::spawn(read_loop(reader, in_tx, channel.clone()));
        channel
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn organization(&self) -> &Organization {
        &self.inner.organization
    }

    pub fn peer(&self) -> &PeerIdentity {
        &self.inner.peer
    }

    pub fn remote(&self) -> &str {
        &self.inner.remote
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.inner.opened_at
    }

    pub fn is_open(&self) -> bool {
        self.inner.closed.borrow().is_none()
    }

    /// Why the channel closed, once it has.
    pub fn close_reason(&self) -> Option<String> {
        self.inner.closed.borrow().clone()
    }

    /// Send an application message.
    pub fn send(&self, payload: serde_json::Value) -> ProtocolResult<()> {
        self.send_frame(Frame::Message { payload })
    }

    /// Ask the peer for a pong.
    pub fn ping(&self, nonce: u64) -> ProtocolResult<()> {
        self.send_frame(Frame::Ping { nonce })
    }

    pub(crate) fn send_frame(&self, frame: Frame) -> ProtocolResult<()> {
        if !self.is_open() {
            return Err(ProtocolError::ConnectionClosed);
        }
        self.inner
            .outbound
            .send(frame)
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Next application message, or `None` once closed and drained.
    pub async fn recv(&self) -> Option<serde_json::Value> {
        self.inner.inbound.lock().await.recv().await
    }

    /// Close the channel, telling the peer why. Closing twice is a no-op.
    pub fn close(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if !self.is_open() {
            return;
        }
        debug!(channel = %self.inner.id, organization = %self.inner.organization, %reason, "closing channel");
        // Queue the close frame before flagging, so the writer still sends it.
        let _ = self.inner.outbound.send(Frame::Close {
            reason: reason.clone(),
        });
        self.mark_closed(reason);
    }

    /// Resolves with the close reason once the channel is closed.
    pub async fn closed(&self) -> String {
        let mut rx = self.inner.closed.subscribe();
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => String::from("channel dropped"),
        };
        reason
    }

    /// Messages discarded because the inbound buffer was full.
    pub fn dropped_messages(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    fn mark_closed(&self, reason: String) {
        self.inner.closed.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(reason);
                true
            } else {
                false
            }
        });
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    mut closed: watch::Receiver<Option<String>>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                let is_close = matches!(frame, Frame::Close { .. });
                if write_frame(&mut writer, &frame).await.is_err() || is_close {
                    break;
                }
            }
            changed = closed.changed() => {
                if changed.is_err() || closed.borrow().is_some() {
                    // Flush whatever was queued before the close.
                    while let Ok(frame) = outbound.try_recv() {
                        if write_frame(&mut writer, &frame).await.is_err() {
                            break;
                        }
                    }
                    break;
                }
            }
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop<R>(mut reader: R, inbound: mpsc::Sender<serde_json::Value>, channel: Channel)
where
    R: AsyncRead + Unpin,
{
    let mut closed = channel.inner.closed.subscribe();
    let reason = loop {
        let frame = tokio::select! {
            frame = read_frame(&mut reader) => frame,
            _ = closed.wait_for(Option::is_some) => return,
        };
        match frame {
            Ok(Frame::Ping { nonce }) => {
                let _ = channel.send_frame(Frame::Pong { nonce });
            }
            Ok(Frame::Pong { .. }) => {}
            // Never block the reader on a slow consumer: control frames and
            // disconnects must still be seen.
            Ok(Frame::Message { payload }) => match inbound.try_send(payload) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    let dropped = channel.inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(
                        channel = %channel.inner.id,
                        organization = %channel.inner.organization,
                        dropped,
                        "inbound buffer full, dropping message"
                    );
                }
                Err(TrySendError::Closed(_)) => break String::from("receiver dropped"),
            },
            Ok(Frame::Close { reason }) => break format!("closed by peer: {reason}"),
            Ok(other) => {
                break format!("protocol violation: unexpected {} frame", other.kind());
            }
            Err(ProtocolError::ConnectionClosed) => break String::from("connection lost"),
            Err(e) => break format!("connection lost: {e}"),
        }
    };
    channel.mark_closed(reason);
}
