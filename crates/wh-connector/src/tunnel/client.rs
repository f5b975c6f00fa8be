//! Reverse tunnel client
//!
//! The client holds one session to the dispatcher while the local node owns
//! the tunnel. Its progress is an explicit state machine published on a
//! `watch` channel:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Draining -> Disconnected
//!                     ^   |          |
//!                     +---+ (retry)  +----> Disconnected (connection lost)
//! ```
//!
//! Draining keeps the session read loop running: in-flight streams still get
//! their frames and late `StreamOpen`s are refused. The session ends when the
//! dispatcher answers with its own `GoAway` or closes the connection, or when
//! the drain grace runs out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use wh_core::config::BackoffConfig;
use wh_core::{Config, LeadershipSnapshot, NodeId, TunnelState};
use wh_protocol::{ErrorCode, Frame, FrameCodec, Message, StreamId, PROTOCOL_VERSION};

use super::dialer::{BoxedIo, Dialer};
use super::reconnect::ExponentialBackoff;
use crate::error::ConnectionError;
use crate::forward::{forward_stream, ForwardTarget, Inbound, StreamIo};

/// Frames queued for the session writer
const OUTBOUND_QUEUE: usize = 1024;

/// Time aborted streams get to report their reset
const ABORT_FLUSH: Duration = Duration::from_millis(500);

/// Time the writer gets to flush after the session ends
const WRITER_FLUSH: Duration = Duration::from_secs(1);

type TunnelConn = Framed<BoxedIo, FrameCodec>;

#[derive(Debug, Clone)]
struct ClientSettings {
    target: ForwardTarget,
    connect_timeout: Duration,
    drain_grace: Duration,
    idle_timeout: Duration,
    stream_buffer: usize,
    backoff: BackoffConfig,
}

/// Routing state of one stream in the session loop
struct StreamSlot {
    inbound: mpsc::Sender<Inbound>,
    credit: Arc<Semaphore>,
}

/// How a registered session ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// The dispatcher released the session after our `GoAway`
    Drained,
    /// The drain grace ran out; remaining streams were reset
    DrainTimedOut,
    /// Hard cancellation
    Aborted,
}

/// Edge side of the reverse tunnel
pub struct TunnelClient {
    node: NodeId,
    settings: ClientSettings,
    dialer: Arc<dyn Dialer>,
    leadership: watch::Receiver<LeadershipSnapshot>,
    state: watch::Sender<TunnelState>,
    /// Graceful stop: no new streams, drain, no redial
    stopping: CancellationToken,
    /// Hard stop: reset everything
    cancel: CancellationToken,
}

impl TunnelClient {
    pub fn new(
        node: NodeId,
        config: &Config,
        dialer: Arc<dyn Dialer>,
        leadership: watch::Receiver<LeadershipSnapshot>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(TunnelState::Disconnected);
        Arc::new(Self {
            node,
            settings: ClientSettings {
                target: ForwardTarget {
                    local_addr: config.local_addr.clone(),
                    max_frame_size: config.tunnel.max_frame_size,
                },
                connect_timeout: config.connect_timeout,
                drain_grace: config.tunnel.drain_grace,
                idle_timeout: config.tunnel.idle_timeout,
                stream_buffer: config.tunnel.stream_buffer,
                backoff: config.tunnel.backoff.clone(),
            },
            dialer,
            leadership,
            state,
            stopping: CancellationToken::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Subscribe to state transitions
    pub fn state(&self) -> watch::Receiver<TunnelState> {
        self.state.subscribe()
    }

    pub fn current_state(&self) -> TunnelState {
        *self.state.borrow()
    }

    /// Refuse new streams, drain the session and do not dial again
    pub fn stop_accepting(&self) {
        if !self.stopping.is_cancelled() {
            tracing::info!("Tunnel client no longer accepting streams");
            self.stopping.cancel();
        }
    }

    /// Reset every stream and close the session now
    pub fn abort(&self) {
        self.stopping.cancel();
        self.cancel.cancel();
    }

    /// Drive the client until stopped
    pub async fn run(self: Arc<Self>) {
        let mut backoff = ExponentialBackoff::from_config(&self.settings.backoff);
        let mut leadership = self.leadership.clone();

        loop {
            self.set_state(TunnelState::Disconnected);

            let term = tokio::select! {
                _ = self.stopping.cancelled() => break,
                term = owned_term(&mut leadership) => match term {
                    Some(term) => term,
                    None => {
                        tracing::warn!("Leadership source closed, tunnel client stopping");
                        break;
                    }
                },
            };
            tracing::info!(term, target = %self.dialer.target(), "Local node owns the tunnel, connecting");

            self.set_state(TunnelState::Connecting);
            let Some(conn) = self.connect(term, &mut backoff, &mut leadership).await else {
                continue;
            };
            backoff.reset();

            self.set_state(TunnelState::Connected);
            match self.serve(conn, term, &mut leadership).await {
                Ok(SessionEnd::Aborted) => break,
                Ok(end) => {
                    tracing::info!(term, ?end, "Tunnel session closed");
                    if self.stopping.is_cancelled() {
                        break;
                    }
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(term, error = %e, "Tunnel session lost, reconnecting in {:?}", delay);
                    if !self.pause(delay).await {
                        break;
                    }
                }
            }
        }

        self.set_state(TunnelState::Disconnected);
        tracing::info!("Tunnel client stopped");
    }

    /// Dial and register until it works, leadership is lost or we stop
    async fn connect(
        &self,
        term: u64,
        backoff: &mut ExponentialBackoff,
        leadership: &mut watch::Receiver<LeadershipSnapshot>,
    ) -> Option<TunnelConn> {
        loop {
            let attempt = tokio::select! {
                _ = self.stopping.cancelled() => return None,
                _ = lost(leadership, term) => {
                    tracing::info!(term, "Leadership lost before the tunnel was established");
                    return None;
                }
                attempt = self.attempt(term) => attempt,
            };

            match attempt {
                Ok(conn) => return Some(conn),
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(term, error = %e, "Tunnel connect failed, retrying in {:?}", delay);
                    tokio::select! {
                        _ = self.stopping.cancelled() => return None,
                        _ = lost(leadership, term) => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// One dial plus registration
    async fn attempt(&self, term: u64) -> Result<TunnelConn, ConnectionError> {
        let io = self.dialer.dial().await?;
        let mut conn = Framed::new(io, FrameCodec::new());

        conn.send(Frame::control(Message::Register {
            node_id: self.node.to_string(),
            term,
            version: PROTOCOL_VERSION.to_string(),
        }))
        .await?;

        let timeout = self.settings.connect_timeout;
        let ack = tokio::time::timeout(timeout, conn.next())
            .await
            .map_err(|_| ConnectionError::RegisterTimeout(timeout))?;

        match ack {
            Some(Ok(Frame {
                message: Message::RegisterAck { accepted: true, session_id, .. },
                ..
            })) => {
                tracing::info!(term, session_id, "Registered with dispatcher");
                Ok(conn)
            }
            Some(Ok(Frame {
                message: Message::RegisterAck { reason, .. },
                ..
            })) => Err(ConnectionError::Rejected {
                reason: reason.unwrap_or_else(|| "no reason given".to_string()),
            }),
            Some(Ok(frame)) => Err(ConnectionError::Remote(format!(
                "expected RegisterAck, got {:?}",
                frame.message.message_type()
            ))),
            Some(Err(e)) => Err(e.into()),
            None => Err(ConnectionError::Closed),
        }
    }

    /// Serve a registered session until it drains, fails or is aborted
    async fn serve(
        &self,
        conn: TunnelConn,
        term: u64,
        leadership: &mut watch::Receiver<LeadershipSnapshot>,
    ) -> Result<SessionEnd, ConnectionError> {
        let (sink, mut source) = conn.split();
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let mut writer = tokio::spawn(write_frames(sink, rx));

        let mut streams: HashMap<StreamId, StreamSlot> = HashMap::new();
        let mut tasks: JoinSet<StreamId> = JoinSet::new();
        let stream_cancel = self.cancel.child_token();
        let mut drain_deadline: Option<Instant> = None;
        let idle = self.settings.idle_timeout;
        let mut last_frame = Instant::now();

        let result = loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => break Ok(SessionEnd::Aborted),

                _ = self.stopping.cancelled(), if drain_deadline.is_none() => {
                    drain_deadline = Some(self.begin_drain(&tx, "connector shutting down").await);
                    continue;
                }

                _ = lost(leadership, term), if drain_deadline.is_none() => {
                    tracing::warn!(term, "Leadership lost, draining tunnel session");
                    drain_deadline = Some(self.begin_drain(&tx, "leadership lost").await);
                    continue;
                }

                _ = sleep_until_opt(drain_deadline), if drain_deadline.is_some() => {
                    tracing::warn!(remaining = tasks.len(), "Drain grace exceeded, resetting streams");
                    break Ok(SessionEnd::DrainTimedOut);
                }

                Some(done) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Ok(id) = done {
                        if let Some(slot) = streams.remove(&id) {
                            slot.credit.close();
                        }
                    }
                    if drain_deadline.is_some() && tasks.is_empty() {
                        tracing::debug!("In-flight streams done, waiting for the dispatcher to release the session");
                    }
                    continue;
                }

                next = tokio::time::timeout_at(last_frame + idle, source.next()) => match next {
                    Ok(Some(Ok(frame))) => frame,
                    Ok(Some(Err(e))) => {
                        let _ = tx.try_send(Frame::control(Message::Error {
                            code: e.code(),
                            message: e.to_string(),
                        }));
                        break Err(e.into());
                    }
                    Ok(None) if drain_deadline.is_some() => break Ok(SessionEnd::Drained),
                    Ok(None) => break Err(ConnectionError::Closed),
                    Err(_) => break Err(ConnectionError::Idle(idle)),
                },
            };
            last_frame = Instant::now();

            if frame.stream_id.is_control() {
                match frame.message {
                    Message::Heartbeat { timestamp } => {
                        let _ = tx
                            .send(Frame::control(Message::HeartbeatAck { timestamp }))
                            .await;
                    }
                    Message::HeartbeatAck { .. } => {}
                    Message::GoAway { reason } => {
                        if drain_deadline.is_some() {
                            if !tasks.is_empty() {
                                tracing::warn!(remaining = tasks.len(), %reason, "Dispatcher released the session with streams still running");
                            }
                            break Ok(SessionEnd::Drained);
                        }
                        break Err(ConnectionError::GoAway { reason });
                    }
                    Message::Error { code, message } => {
                        break Err(ConnectionError::Remote(format!("{:?}: {}", code, message)));
                    }
                    other => {
                        tracing::debug!(message_type = ?other.message_type(), "Ignoring unexpected control message");
                    }
                }
                continue;
            }

            let id = frame.stream_id;
            match frame.message {
                Message::StreamOpen { deadline_ms, window } => {
                    let refusal = if drain_deadline.is_some() {
                        Some((ErrorCode::Refused, "connector draining"))
                    } else if streams.contains_key(&id) {
                        Some((ErrorCode::InvalidMessage, "stream already open"))
                    } else {
                        None
                    };
                    if let Some((code, message)) = refusal {
                        let _ = tx
                            .send(Frame::new(
                                id,
                                Message::StreamReset {
                                    code,
                                    message: message.to_string(),
                                },
                            ))
                            .await;
                        continue;
                    }

                    let own_window = self.settings.stream_buffer.clamp(1, u32::MAX as usize) as u32;
                    let (stream_tx, stream_rx) = mpsc::channel(own_window as usize + 1);
                    let credit = Arc::new(Semaphore::new(window as usize));
                    streams.insert(
                        id,
                        StreamSlot {
                            inbound: stream_tx,
                            credit: Arc::clone(&credit),
                        },
                    );
                    // Accepting the stream grants the dispatcher its send window
                    let _ = tx
                        .send(Frame::new(id, Message::WindowUpdate { increment: own_window }))
                        .await;
                    tasks.spawn(forward_stream(
                        id,
                        self.settings.target.clone(),
                        deadline_ms,
                        StreamIo {
                            inbound: stream_rx,
                            credit,
                            window: own_window,
                            outbound: tx.clone(),
                        },
                        stream_cancel.clone(),
                    ));
                    tracing::debug!(stream = %id, deadline_ms, window, "Stream opened");
                }
                Message::WindowUpdate { increment } => {
                    if let Some(slot) = streams.get(&id) {
                        let room = Semaphore::MAX_PERMITS.saturating_sub(slot.credit.available_permits());
                        slot.credit.add_permits((increment as usize).min(room));
                    }
                }
                Message::Data(data) => route(&mut streams, id, Inbound::Data(data), &tx),
                Message::StreamEnd => route(&mut streams, id, Inbound::End, &tx),
                Message::StreamReset { .. } | Message::Error { .. } => {
                    route(&mut streams, id, Inbound::Reset, &tx);
                    if let Some(slot) = streams.remove(&id) {
                        slot.credit.close();
                    }
                }
                other => {
                    tracing::debug!(stream = %id, message_type = ?other.message_type(), "Ignoring unexpected stream message");
                }
            }
        };

        stream_cancel.cancel();
        let _ = tokio::time::timeout(ABORT_FLUSH, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        tasks.abort_all();
        drop(streams);
        drop(tx);
        if tokio::time::timeout(WRITER_FLUSH, &mut writer).await.is_err() {
            writer.abort();
        }

        result
    }

    async fn begin_drain(&self, tx: &mpsc::Sender<Frame>, reason: &str) -> Instant {
        self.set_state(TunnelState::Draining);
        let _ = tx
            .send(Frame::control(Message::GoAway {
                reason: reason.to_string(),
            }))
            .await;
        Instant::now() + self.settings.drain_grace
    }

    /// Sleep unless stopped; false when the client should exit
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.stopping.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn set_state(&self, next: TunnelState) {
        self.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            tracing::debug!(from = %state, to = %next, "Tunnel state changed");
            *state = next;
            true
        });
    }
}

async fn write_frames(mut sink: SplitSink<TunnelConn, Frame>, mut rx: mpsc::Receiver<Frame>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = sink.send(frame).await {
            tracing::debug!(error = %e, "Tunnel write failed");
            break;
        }
    }
    let _ = sink.close().await;
}

/// Hand a frame to its stream without waiting. A stream whose buffer is
/// full was sent more than its window and is reset with `FlowControl`.
fn route(
    streams: &mut HashMap<StreamId, StreamSlot>,
    id: StreamId,
    event: Inbound,
    outbound: &mpsc::Sender<Frame>,
) {
    let Some(slot) = streams.get(&id) else {
        tracing::debug!(stream = %id, "Frame for unknown stream");
        return;
    };
    let overrun = match slot.inbound.try_send(event) {
        Ok(()) => return,
        Err(TrySendError::Full(_)) => true,
        Err(TrySendError::Closed(_)) => false,
    };

    if let Some(slot) = streams.remove(&id) {
        slot.credit.close();
    }
    if overrun {
        tracing::warn!(stream = %id, "Dispatcher overran the stream window, resetting");
        let _ = outbound.try_send(Frame::new(
            id,
            Message::StreamReset {
                code: ErrorCode::FlowControl,
                message: "receive window exceeded".into(),
            },
        ));
    }
}

/// Term the local node owns, once it owns one
async fn owned_term(rx: &mut watch::Receiver<LeadershipSnapshot>) -> Option<u64> {
    rx.wait_for(LeadershipSnapshot::is_owner)
        .await
        .ok()
        .map(|snapshot| snapshot.term)
}

/// Resolves once the local node no longer owns `term`
async fn lost(rx: &mut watch::Receiver<LeadershipSnapshot>, term: u64) {
    let _ = rx
        .wait_for(|snapshot| !(snapshot.is_owner() && snapshot.term == term))
        .await;
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
