//! Server-side representation of one client connection.
//!
//! A [`Proxy`] is the handle handlers use to talk back to a client over its
//! message channel. It is either:
//!
//! - **connected**: created by the server once the handshake and reverse dial
//!   succeed; messages go straight to the channel's writer task, or
//! - a **record**: created before any client exists; messages are buffered in
//!   a bounded [`PendingQueue`] until a connected proxy [`adopts`](Proxy::adopt)
//!   it, at which point the queue is moved over and flushed in order.
//!
//! The command channel belongs to the server connection entry wrapping the
//! proxy. The read and write loops below only move bytes; every handler call
//! happens on the server's dispatch loop.

// Rust guideline compliant 2026-02

use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::framing::{self, DisconnectReason, FrameError};
use crate::packet::Packet;
use crate::server::ServerEvent;

/// Process-unique proxy identifier.
pub type ProxyId = u64;

fn next_proxy_id() -> ProxyId {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Errors returned by proxy operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Messages must carry at least one value.
    #[error("refusing to send an empty message")]
    EmptyPacket,

    /// The record proxy's buffer is full.
    #[error("pending queue full ({limit} frames)")]
    QueueFull {
        /// Configured limit.
        limit: usize,
    },

    /// The connection is gone.
    #[error("message channel closed")]
    ChannelClosed,

    /// Only record proxies can be adopted.
    #[error("proxy {0} is not a record proxy")]
    NotARecord(ProxyId),

    /// Framing failed.
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// A failed [`Proxy::adopt`], handing the record back to the caller.
#[derive(Debug, Error)]
#[error("cannot adopt record {}: {error}", .record.id)]
pub struct AdoptError {
    /// What went wrong.
    pub error: ProxyError,
    /// The record, still holding whatever was not flushed.
    pub record: Proxy,
}

/// Lifecycle of a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    /// Buffering until a connection adopts the queue.
    AwaitingReverseChannel,
    /// Messages are written to the client.
    Connected,
    /// Torn down; no further I/O.
    Terminated,
}

/// Bounded FIFO of encoded message frames.
#[derive(Debug, Clone, Default)]
pub struct PendingQueue {
    frames: VecDeque<Vec<u8>>,
    limit: usize,
}

impl PendingQueue {
    /// Empty queue holding at most `limit` frames.
    pub fn new(limit: usize) -> Self {
        Self { frames: VecDeque::new(), limit }
    }

    /// Append a frame, failing once the limit is reached.
    pub fn push(&mut self, frame: Vec<u8>) -> Result<(), ProxyError> {
        if self.frames.len() >= self.limit {
            return Err(ProxyError::QueueFull { limit: self.limit });
        }
        self.frames.push_back(frame);
        Ok(())
    }

    /// Number of buffered frames.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[derive(Debug)]
enum Outbound {
    Pending(PendingQueue),
    Live(UnboundedSender<Vec<u8>>),
    Closed,
}

/// One client as seen by server handlers.
pub struct Proxy {
    id: ProxyId,
    state: ProxyState,
    postfix: Option<String>,
    outbound: Outbound,
    terminate_requested: bool,
    disconnect_reason: Option<DisconnectReason>,
    context: Option<Box<dyn Any + Send>>,
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("postfix", &self.postfix)
            .field("pending", &self.pending_len())
            .finish_non_exhaustive()
    }
}

impl Proxy {
    /// Create a record proxy that buffers up to `limit` messages.
    pub fn record(limit: usize) -> Self {
        Self::with_outbound(
            ProxyState::AwaitingReverseChannel,
            None,
            Outbound::Pending(PendingQueue::new(limit)),
        )
    }

    /// Create a connected proxy writing to a message-channel writer task.
    pub(crate) fn connected(postfix: String, message_tx: UnboundedSender<Vec<u8>>) -> Self {
        Self::with_outbound(ProxyState::Connected, Some(postfix), Outbound::Live(message_tx))
    }

    fn with_outbound(state: ProxyState, postfix: Option<String>, outbound: Outbound) -> Self {
        Self {
            id: next_proxy_id(),
            state,
            postfix,
            outbound,
            terminate_requested: false,
            disconnect_reason: None,
            context: None,
        }
    }

    /// Proxy identifier.
    pub fn id(&self) -> ProxyId {
        self.id
    }

    /// Lifecycle state.
    pub fn state(&self) -> ProxyState {
        self.state
    }

    /// Client postfix, `None` for record proxies.
    pub fn postfix(&self) -> Option<&str> {
        self.postfix.as_deref()
    }

    /// Whether this proxy buffers instead of writing.
    pub fn is_record(&self) -> bool {
        matches!(self.outbound, Outbound::Pending(_))
    }

    /// Whether messages currently reach a client.
    pub fn is_connected(&self) -> bool {
        self.state == ProxyState::Connected
    }

    /// Buffered frame count (always zero once connected).
    pub fn pending_len(&self) -> usize {
        match &self.outbound {
            Outbound::Pending(queue) => queue.len(),
            Outbound::Live(_) | Outbound::Closed => 0,
        }
    }

    /// Why the proxy was torn down, once it has been.
    pub fn disconnect_reason(&self) -> Option<&DisconnectReason> {
        self.disconnect_reason.as_ref()
    }

    /// Send an asynchronous message to the client.
    ///
    /// Connected proxies hand the frame to the writer task; record proxies
    /// buffer it.
    pub fn send_message(&mut self, packet: &Packet) -> Result<(), ProxyError> {
        if packet.is_empty() {
            return Err(ProxyError::EmptyPacket);
        }
        let frame = framing::encode_frame(0, 0, packet.as_bytes())?;

        let id = self.id;
        match &mut self.outbound {
            Outbound::Live(tx) => tx.send(frame).map_err(|_| ProxyError::ChannelClosed),
            Outbound::Pending(queue) => queue.push(frame).inspect_err(|e| {
                log::error!("[Proxy] Dropping message for record proxy {id}: {e}");
            }),
            Outbound::Closed => Err(ProxyError::ChannelClosed),
        }
    }

    /// Take over a record proxy's buffered messages.
    ///
    /// The queue is moved, not copied: a connected proxy flushes it onto its
    /// message channel in FIFO order, a record proxy appends it to its own
    /// queue. The record is consumed. Returns the number of frames moved.
    ///
    /// A record that is not adopted comes back inside the [`AdoptError`] with
    /// its queue intact. That happens when `record` is not a record proxy, when
    /// `self` is closed, or when merging would take `self` past its limit.
    pub fn adopt(&mut self, mut record: Proxy) -> Result<usize, AdoptError> {
        if !record.is_record() {
            let error = ProxyError::NotARecord(record.id);
            return Err(AdoptError { error, record });
        }

        let moved = record.pending_len();
        match &self.outbound {
            Outbound::Pending(own) if own.len() + moved > own.limit => {
                let error = ProxyError::QueueFull { limit: own.limit };
                log::error!(
                    "[Proxy] Record {} cannot take {moved} frames from record {}: {error}",
                    self.id,
                    record.id
                );
                return Err(AdoptError { error, record });
            }
            Outbound::Closed => {
                return Err(AdoptError { error: ProxyError::ChannelClosed, record });
            }
            Outbound::Pending(_) | Outbound::Live(_) => {}
        }

        let mut frames = match &mut record.outbound {
            Outbound::Pending(queue) => std::mem::take(&mut queue.frames),
            Outbound::Live(_) | Outbound::Closed => VecDeque::new(),
        };
        match &mut self.outbound {
            Outbound::Live(tx) => {
                while let Some(frame) = frames.pop_front() {
                    if let Err(unsent) = tx.send(frame) {
                        frames.push_front(unsent.0);
                        if let Outbound::Pending(queue) = &mut record.outbound {
                            queue.frames = frames;
                        }
                        return Err(AdoptError { error: ProxyError::ChannelClosed, record });
                    }
                }
            }
            Outbound::Pending(own) => own.frames.extend(frames),
            Outbound::Closed => {}
        }

        log::debug!("[Proxy] Proxy {} adopted {moved} frames from record {}", self.id, record.id);
        Ok(moved)
    }

    /// Close the connection once the current dispatch returns.
    pub fn set_terminate(&mut self) {
        self.terminate_requested = true;
    }

    /// Whether [`set_terminate`](Self::set_terminate) was called.
    pub fn is_terminate_requested(&self) -> bool {
        self.terminate_requested
    }

    /// Attach caller-owned state.
    pub fn set_context<T: Any + Send>(&mut self, context: T) {
        self.context = Some(Box::new(context));
    }

    /// Borrow attached state of type `T`.
    pub fn context<T: Any + Send>(&self) -> Option<&T> {
        self.context.as_ref()?.downcast_ref()
    }

    /// Mutably borrow attached state of type `T`.
    pub fn context_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.context.as_mut()?.downcast_mut()
    }

    /// Detach and return state of type `T`.
    pub fn take_context<T: Any + Send>(&mut self) -> Option<T> {
        if !self.context.as_ref()?.is::<T>() {
            return None;
        }
        self.context.take()?.downcast::<T>().ok().map(|boxed| *boxed)
    }

    /// Mark the proxy terminated and drop its message channel.
    pub(crate) fn mark_terminated(&mut self, reason: DisconnectReason) {
        self.state = ProxyState::Terminated;
        self.outbound = Outbound::Closed;
        self.disconnect_reason = Some(reason);
    }
}

/// Read loop for a command channel: decodes frames and forwards them.
///
/// Ends with exactly one [`ServerEvent::Closed`] unless the dispatch loop is gone.
pub(crate) async fn read_loop(
    id: ProxyId,
    mut reader: tokio::net::unix::OwnedReadHalf,
    event_tx: UnboundedSender<ServerEvent>,
) {
    loop {
        match framing::read_frame_async(&mut reader).await {
            Ok(frame) => {
                let event = ServerEvent::Command { id, header: frame.header, body: frame.body };
                if event_tx.send(event).is_err() {
                    return;
                }
            }
            Err(e) => {
                match &e {
                    FrameError::HungUp => log::debug!("[Proxy] Proxy {id} hung up"),
                    other => log::error!("[Proxy] Read error for proxy {id}: {other}"),
                }
                let reason = DisconnectReason::from(&e);
                let _ = event_tx.send(ServerEvent::Closed { id, reason });
                return;
            }
        }
    }
}

/// Write loop: receives encoded frames and writes them in order.
///
/// Exits when the sender is dropped or a write fails.
pub(crate) async fn write_loop<W>(
    id: ProxyId,
    mut writer: W,
    mut frame_rx: UnboundedReceiver<Vec<u8>>,
    event_tx: UnboundedSender<ServerEvent>,
) where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(data) = frame_rx.recv().await {
        if let Err(e) = writer.write_all(&data).await {
            log::error!("[Proxy] Write error for proxy {id}: {e}");
            let reason = match e.kind() {
                std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset => {
                    DisconnectReason::HungUp
                }
                _ => DisconnectReason::Io(e.to_string()),
            };
            let _ = event_tx.send(ServerEvent::Closed { id, reason });
            return;
        }
    }
    let _ = writer.shutdown().await;
}
