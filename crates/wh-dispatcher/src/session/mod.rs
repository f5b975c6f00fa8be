//! Tunnel sessions
//!
//! A [`Session`] is one registered connection from the tunnel owner. It
//! multiplexes any number of [`Stream`]s, bounded by a per-session
//! semaphore. All outbound frames go through one queue drained by a single
//! writer task, which keeps frames of one stream in order.
//!
//! Each stream has its own credit window in both directions. Inbound frames
//! are routed without waiting: a stream can only buffer what it granted, so
//! one stalled reader never blocks the session's read loop.

mod manager;
mod stream;

pub use manager::{SessionEvent, SessionManager};
pub use stream::Stream;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use wh_core::{DispatchError, NodeId, SessionId};
use wh_protocol::{ErrorCode, Frame, Message, StreamId};

/// Per-session limits
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub max_streams: usize,
    pub max_frame_size: usize,
    /// Receive window per stream, in `Data` frames
    pub stream_buffer: usize,
}

impl SessionLimits {
    pub(crate) fn window(&self) -> u32 {
        self.stream_buffer.clamp(1, u32::MAX as usize) as u32
    }
}

/// Inbound events routed to one stream
#[derive(Debug)]
pub(crate) enum Inbound {
    Data(Bytes),
    End,
    Reset { code: ErrorCode, message: String },
}

/// Routing state of one open stream
struct StreamSlot {
    inbound: mpsc::Sender<Inbound>,
    /// `Data` frames the connector still lets us send
    credit: Arc<Semaphore>,
}

/// An active tunnel session
pub struct Session {
    pub id: SessionId,
    /// Cluster node that registered
    pub node: NodeId,
    /// Term the node registered with
    pub term: u64,
    /// SHA-256 of the connector's client certificate
    pub fingerprint: Option<String>,
    pub created_at: Instant,

    limits: SessionLimits,
    last_activity: Mutex<Instant>,
    streams: DashMap<StreamId, StreamSlot>,
    next_stream: AtomicU32,
    permits: Arc<Semaphore>,
    outbound: mpsc::Sender<Frame>,
    stream_closed: Notify,
    draining: AtomicBool,
    closed: CancellationToken,
    close_reason: OnceLock<String>,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        node: NodeId,
        term: u64,
        fingerprint: Option<String>,
        limits: SessionLimits,
        outbound: mpsc::Sender<Frame>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            node,
            term,
            fingerprint,
            created_at: now,
            limits,
            last_activity: Mutex::new(now),
            streams: DashMap::new(),
            next_stream: AtomicU32::new(1),
            permits: Arc::new(Semaphore::new(limits.max_streams)),
            outbound,
            stream_closed: Notify::new(),
            draining: AtomicBool::new(false),
            closed: CancellationToken::new(),
            close_reason: OnceLock::new(),
        }
    }

    /// Streams currently registered on this session
    pub fn open_streams(&self) -> usize {
        self.streams.len()
    }

    /// Stream slots not currently in use
    pub fn available_slots(&self) -> usize {
        self.permits.available_permits()
    }

    /// Time since the last inbound frame
    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    /// New streams may be opened
    pub fn is_accepting(&self) -> bool {
        !self.is_draining() && !self.is_closed()
    }

    /// The connector sent `GoAway`
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Why the session was closed, once it is
    pub fn close_reason(&self) -> Option<&str> {
        self.close_reason.get().map(String::as_str)
    }

    /// Resolves when the session is closed
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub(crate) fn touch(&self) {
        if let Ok(mut t) = self.last_activity.lock() {
            *t = Instant::now();
        }
    }

    pub(crate) fn start_drain(&self) -> bool {
        !self.draining.swap(true, Ordering::SeqCst)
    }

    /// Close the session. Returns true for the first caller only.
    ///
    /// Every open stream observes `Cancelled` and waiting openers fail.
    pub(crate) fn close(&self, reason: &str) -> bool {
        if self.close_reason.set(reason.to_string()).is_err() {
            return false;
        }
        self.closed.cancel();
        self.permits.close();
        for slot in self.streams.iter() {
            slot.credit.close();
        }
        self.streams.clear();
        self.stream_closed.notify_one();
        true
    }

    fn cancelled(&self) -> DispatchError {
        DispatchError::Cancelled(
            self.close_reason()
                .unwrap_or("session closed")
                .to_string(),
        )
    }

    /// Wait for a free stream slot
    pub(crate) async fn acquire(
        self: &Arc<Self>,
        timeout: Duration,
    ) -> Result<OwnedSemaphorePermit, DispatchError> {
        match tokio::time::timeout(timeout, self.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(self.cancelled()),
            Err(_) => Err(DispatchError::Overload {
                limit: self.limits.max_streams,
            }),
        }
    }

    /// Register a new stream and announce it to the connector
    pub(crate) async fn open_stream(
        self: &Arc<Self>,
        permit: OwnedSemaphorePermit,
        deadline: Duration,
    ) -> Result<Stream, DispatchError> {
        if !self.is_accepting() {
            return Err(self.cancelled());
        }

        let id = StreamId::new(self.next_stream.fetch_add(1, Ordering::SeqCst));
        let window = self.limits.window();
        // One spare slot so the terminal event always fits behind a full window
        let (tx, rx) = mpsc::channel(window as usize + 1);
        // No credit until the connector accepts the stream
        let credit = Arc::new(Semaphore::new(0));
        self.streams.insert(
            id,
            StreamSlot {
                inbound: tx,
                credit: Arc::clone(&credit),
            },
        );

        let stream = Stream::new(id, Arc::clone(self), rx, credit, permit, deadline);
        self.send(Frame::new(
            id,
            Message::StreamOpen {
                deadline_ms: deadline.as_millis() as u64,
                window,
            },
        ))
        .await?;

        tracing::debug!(session = %self.id, stream = %id, "Stream opened");
        Ok(stream)
    }

    /// Queue a frame for the writer task
    pub(crate) async fn send(&self, frame: Frame) -> Result<(), DispatchError> {
        if self.is_closed() {
            return Err(self.cancelled());
        }
        self.outbound.send(frame).await.map_err(|_| self.cancelled())
    }

    /// Best-effort send from synchronous contexts
    pub(crate) fn try_send(&self, frame: Frame) {
        if !self.is_closed() {
            let _ = self.outbound.try_send(frame);
        }
    }

    /// Deliver an inbound stream frame to its owner.
    ///
    /// Never waits. A connector that sends past the window we granted gets
    /// the stream reset with `FlowControl`.
    pub(crate) fn route(&self, frame: Frame) {
        let id = frame.stream_id;
        let (event, last) = match frame.message {
            Message::WindowUpdate { increment } => {
                if let Some(slot) = self.streams.get(&id) {
                    let room = Semaphore::MAX_PERMITS.saturating_sub(slot.credit.available_permits());
                    slot.credit.add_permits((increment as usize).min(room));
                }
                return;
            }
            Message::Data(data) => (Inbound::Data(data), false),
            Message::StreamEnd => (Inbound::End, true),
            Message::StreamReset { code, message } | Message::Error { code, message } => {
                (Inbound::Reset { code, message }, true)
            }
            other => {
                tracing::debug!(
                    session = %self.id,
                    stream = %id,
                    message_type = ?other.message_type(),
                    "Ignoring unexpected message on stream"
                );
                return;
            }
        };

        let Some(inbound) = self.streams.get(&id).map(|slot| slot.inbound.clone()) else {
            tracing::debug!(session = %self.id, stream = %id, "Frame for unknown stream");
            return;
        };
        match inbound.try_send(event) {
            Ok(()) if last => self.remove_stream(id),
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!(session = %self.id, stream = %id, "Connector overran the stream window, resetting");
                self.remove_stream(id);
                self.try_send(Frame::new(
                    id,
                    Message::StreamReset {
                        code: ErrorCode::FlowControl,
                        message: "receive window exceeded".into(),
                    },
                ));
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(session = %self.id, stream = %id, "Stream receiver gone");
                self.remove_stream(id);
            }
        }
    }

    pub(crate) fn remove_stream(&self, id: StreamId) {
        if let Some((_, slot)) = self.streams.remove(&id) {
            slot.credit.close();
            self.stream_closed.notify_one();
        }
    }

    /// Resolves after any stream is removed
    pub(crate) async fn stream_removed(&self) {
        self.stream_closed.notified().await
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("node", &self.node)
            .field("term", &self.term)
            .field("open_streams", &self.open_streams())
            .field("draining", &self.is_draining())
            .field("closed", &self.is_closed())
            .finish()
    }
}
