//! Reverse-tunnel listener and per-session loops

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::codec::Framed;
use wh_core::tls::{peer_fingerprint, TlsServer};
use wh_core::NodeId;
use wh_protocol::{ErrorCode, Frame, FrameCodec, Message, PROTOCOL_VERSION};

use crate::dispatcher::Dispatcher;
use crate::session::{Session, SessionManager};

/// Frames queued for one session's writer
const OUTBOUND_QUEUE: usize = 1024;

/// How long the writer tries to deliver a final `GoAway`
const GOAWAY_TIMEOUT: Duration = Duration::from_secs(1);

type FrameSink<S> = futures::stream::SplitSink<Framed<S, FrameCodec>, Frame>;

impl Dispatcher {
    pub(crate) async fn run_tunnel_listener(self: Arc<Self>, listener: TcpListener, tls: TlsServer) {
        loop {
            tokio::select! {
                _ = self.accepting.cancelled() => {
                    tracing::info!("Reverse tunnel listener stopped");
                    break;
                }

                result = listener.accept() => {
                    let (tcp, peer) = match result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::error!("Failed to accept tunnel connection: {}", e);
                            continue;
                        }
                    };

                    let this = Arc::clone(&self);
                    let tls = tls.clone();
                    self.tasks.spawn(async move {
                        match tls.accept(tcp, this.settings.register_timeout).await {
                            Ok(stream) => {
                                let fingerprint = peer_fingerprint(stream.get_ref().1);
                                this.serve_tunnel(stream, peer.to_string(), fingerprint).await;
                            }
                            Err(e) => {
                                tracing::warn!(%peer, error = %e, "Tunnel handshake failed");
                            }
                        }
                    });
                }
            }
        }
    }

    /// Run one connector connection to completion.
    ///
    /// Waits for `Register`, admits it through the leadership authority and
    /// then serves the session until either side closes it.
    pub async fn serve_tunnel<S>(self: &Arc<Self>, io: S, peer: String, fingerprint: Option<String>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut source) = Framed::new(io, FrameCodec::new()).split();

        let first = tokio::select! {
            _ = self.shutdown.cancelled() => return,
            first = tokio::time::timeout(self.settings.register_timeout, source.next()) => first,
        };

        let (node, term, version) = match first {
            Ok(Some(Ok(Frame {
                message: Message::Register { node_id, term, version },
                ..
            }))) => (NodeId::new(node_id), term, version),
            Ok(Some(Ok(frame))) => {
                tracing::warn!(%peer, message_type = ?frame.message.message_type(), "Expected Register");
                let _ = sink
                    .send(Frame::control(Message::Error {
                        code: ErrorCode::InvalidMessage,
                        message: "expected Register".into(),
                    }))
                    .await;
                return;
            }
            Ok(Some(Err(e))) => {
                tracing::warn!(%peer, error = %e, "Malformed registration");
                return;
            }
            Ok(None) => {
                tracing::debug!(%peer, "Connection closed before registering");
                return;
            }
            Err(_) => {
                tracing::warn!(%peer, "Registration timed out");
                return;
            }
        };

        if !version_compatible(&version) {
            tracing::warn!(%peer, %node, %version, "Incompatible protocol version");
            reject(&mut sink, format!("unsupported protocol version {}", version)).await;
            return;
        }
        if self.shutdown.is_cancelled() {
            reject(&mut sink, "dispatcher shutting down".into()).await;
            return;
        }

        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let session = match self.manager.register(
            self.authority.as_ref(),
            node.clone(),
            term,
            fingerprint,
            self.limits,
            tx,
        ) {
            Ok(session) => session,
            Err(reason) => {
                tracing::warn!(%peer, %node, term, %reason, "Registration rejected");
                reject(&mut sink, reason).await;
                return;
            }
        };

        let ack = Frame::control(Message::RegisterAck {
            accepted: true,
            reason: None,
            session_id: session.id.0,
        });
        if let Err(e) = sink.send(ack).await {
            self.manager.close(&session, &format!("failed to acknowledge: {}", e));
            return;
        }
        tracing::info!(%peer, session = %session.id, %node, term, "Connector registered");

        self.tasks.spawn(write_loop(
            sink,
            rx,
            Arc::clone(&self.manager),
            Arc::clone(&session),
            self.settings.heartbeat_interval,
        ));

        let reason = self.read_loop(&mut source, &session).await;
        self.manager.close(&session, &reason);
    }

    /// Read frames until the session ends; returns the close reason
    async fn read_loop<S>(
        &self,
        source: &mut futures::stream::SplitStream<Framed<S, FrameCodec>>,
        session: &Arc<Session>,
    ) -> String
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let idle = self.settings.idle_timeout;
        let mut last_frame = Instant::now();

        loop {
            let next = tokio::select! {
                biased;
                _ = session.closed() => {
                    return session.close_reason().unwrap_or("closed").to_string();
                }
                _ = session.stream_removed(), if session.is_draining() => {
                    if session.open_streams() == 0 {
                        return "drained".to_string();
                    }
                    continue;
                }
                next = tokio::time::timeout_at(last_frame + idle, source.next()) => next,
            };

            let frame = match next {
                Ok(Some(Ok(frame))) => frame,
                Ok(Some(Err(e))) => {
                    session.try_send(Frame::control(Message::Error {
                        code: e.code(),
                        message: e.to_string(),
                    }));
                    return format!("protocol error: {}", e);
                }
                Ok(None) => return "connection closed by connector".to_string(),
                Err(_) => {
                    tracing::warn!(session = %session.id, "No frames for {:?}", idle);
                    return "idle timeout".to_string();
                }
            };

            last_frame = Instant::now();
            session.touch();

            if !frame.stream_id.is_control() {
                session.route(frame);
                continue;
            }

            match frame.message {
                Message::Heartbeat { timestamp } => {
                    let _ = session
                        .send(Frame::control(Message::HeartbeatAck { timestamp }))
                        .await;
                }
                Message::HeartbeatAck { timestamp } => {
                    let rtt = unix_millis().saturating_sub(timestamp);
                    tracing::trace!(session = %session.id, rtt_ms = rtt, "Heartbeat acknowledged");
                }
                Message::GoAway { reason } => {
                    self.manager.drain(session, &reason);
                }
                Message::Error { code, message } => {
                    return format!("connector error {:?}: {}", code, message);
                }
                Message::Register { .. } => {
                    return "duplicate registration".to_string();
                }
                other => {
                    tracing::debug!(
                        session = %session.id,
                        message_type = ?other.message_type(),
                        "Ignoring unexpected control message"
                    );
                }
            }
        }
    }
}

/// Single writer for one session: queued frames, then heartbeats
async fn write_loop<S>(
    mut sink: FrameSink<S>,
    mut rx: mpsc::Receiver<Frame>,
    manager: Arc<SessionManager>,
    session: Arc<Session>,
    heartbeat_interval: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut heartbeat = tokio::time::interval_at(Instant::now() + heartbeat_interval, heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let frame = tokio::select! {
            biased;
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = session.closed() => break,
            _ = heartbeat.tick() => Frame::control(Message::Heartbeat { timestamp: unix_millis() }),
        };

        if let Err(e) = sink.send(frame).await {
            tracing::warn!(session = %session.id, error = %e, "Tunnel write failed");
            manager.close(&session, &format!("write failed: {}", e));
            break;
        }
    }

    let reason = session.close_reason().unwrap_or("closed").to_string();
    let _ = tokio::time::timeout(GOAWAY_TIMEOUT, async {
        sink.send(Frame::control(Message::GoAway { reason })).await?;
        sink.close().await
    })
    .await;
}

async fn reject<S>(sink: &mut FrameSink<S>, reason: String)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let nack = Frame::control(Message::RegisterAck {
        accepted: false,
        reason: Some(reason),
        session_id: 0,
    });
    let _ = sink.send(nack).await;
    let _ = sink.close().await;
}

/// Same major version as ours
fn version_compatible(version: &str) -> bool {
    let major = |v: &str| v.split('.').next().map(str::to_string);
    major(version).is_some_and(|m| Some(m) == major(PROTOCOL_VERSION))
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_compatible() {
        assert!(version_compatible("1.0"));
        assert!(version_compatible("1.7"));
        assert!(!version_compatible("2.0"));
        assert!(!version_compatible(""));
    }
}
