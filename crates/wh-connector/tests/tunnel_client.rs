//! Tunnel client against a scripted dispatcher over in-memory pipes

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::codec::Framed;
use wh_connector::{BoxedIo, Dialer, TunnelClient};
use wh_core::{Config, LeadershipSnapshot, NodeId, TransportError, TunnelState};
use wh_protocol::{ErrorCode, Frame, FrameCodec, Message, StreamId};

type Conn = Framed<DuplexStream, FrameCodec>;

/// Hands the far end of every dial to the test; fails the first `failures`
struct DuplexDialer {
    accepted: mpsc::UnboundedSender<DuplexStream>,
    failures: AtomicUsize,
    attempts: AtomicUsize,
}

#[async_trait]
impl Dialer for DuplexDialer {
    async fn dial(&self) -> Result<BoxedIo, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::Closed);
        }
        let (near, far) = tokio::io::duplex(1 << 20);
        self.accepted.send(far).map_err(|_| TransportError::Closed)?;
        Ok(Box::new(near))
    }

    fn target(&self) -> String {
        "duplex".to_string()
    }
}

struct Harness {
    client: Arc<TunnelClient>,
    leadership: watch::Sender<LeadershipSnapshot>,
    dials: Mutex<mpsc::UnboundedReceiver<DuplexStream>>,
    dialer: Arc<DuplexDialer>,
    task: tokio::task::JoinHandle<()>,
}

fn owner(term: u64) -> LeadershipSnapshot {
    LeadershipSnapshot {
        term,
        leader: Some(NodeId::new("node-a")),
        owner: true,
        quorum: true,
        commit_index: term,
    }
}

fn follower(term: u64) -> LeadershipSnapshot {
    LeadershipSnapshot {
        term,
        leader: Some(NodeId::new("node-b")),
        owner: false,
        quorum: true,
        commit_index: term,
    }
}

fn test_config(local_addr: &str) -> Config {
    let mut config = Config::default();
    config.local_addr = local_addr.to_string();
    config.connect_timeout = Duration::from_secs(2);
    config.tunnel.drain_grace = Duration::from_secs(2);
    config.tunnel.backoff.initial = Duration::from_millis(10);
    config.tunnel.backoff.max = Duration::from_millis(50);
    config
}

fn start(config: Config, initial: LeadershipSnapshot, failures: usize) -> Harness {
    let (tx, rx) = mpsc::unbounded_channel();
    let dialer = Arc::new(DuplexDialer {
        accepted: tx,
        failures: AtomicUsize::new(failures),
        attempts: AtomicUsize::new(0),
    });
    let (leadership, leadership_rx) = watch::channel(initial);
    let client = TunnelClient::new(NodeId::new("node-a"), &config, dialer.clone(), leadership_rx);
    let task = tokio::spawn(Arc::clone(&client).run());
    Harness {
        client,
        leadership,
        dials: Mutex::new(rx),
        dialer,
        task,
    }
}

impl Harness {
    async fn next_dial(&self) -> Conn {
        let far = tokio::time::timeout(Duration::from_secs(5), self.dials.lock().await.recv())
            .await
            .expect("no dial")
            .expect("dialer gone");
        Framed::new(far, FrameCodec::new())
    }

    /// Accept the next dial and acknowledge its registration
    async fn accept(&self, expected_term: u64) -> Conn {
        let mut conn = self.next_dial().await;
        match next_frame(&mut conn).await.message {
            Message::Register { node_id, term, .. } => {
                assert_eq!(node_id, "node-a");
                assert_eq!(term, expected_term);
            }
            other => panic!("expected Register, got {:?}", other),
        }
        conn.send(Frame::control(Message::RegisterAck {
            accepted: true,
            reason: None,
            session_id: 1,
        }))
        .await
        .unwrap();
        wait_state(&self.client, TunnelState::Connected).await;
        conn
    }
}

async fn next_frame(conn: &mut Conn) -> Frame {
    tokio::time::timeout(Duration::from_secs(5), conn.next())
        .await
        .expect("timed out waiting for frame")
        .expect("connection closed")
        .expect("decode error")
}

async fn wait_state(client: &TunnelClient, expected: TunnelState) {
    let mut state = client.state();
    tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| *s == expected))
        .await
        .unwrap_or_else(|_| panic!("state never became {}", expected))
        .unwrap();
}

/// Window the scripted dispatcher grants on every stream it opens
const DISPATCHER_WINDOW: u32 = 1024;

fn open(deadline_ms: u64) -> Message {
    Message::StreamOpen {
        deadline_ms,
        window: DISPATCHER_WINDOW,
    }
}

/// Local service: read the whole request, optionally wait, echo it back
async fn echo_service(delay: Duration) -> String {
    signalling_echo_service(delay).await.0
}

/// Like [`echo_service`], also reporting each request once fully read
async fn signalling_echo_service(delay: Duration) -> (String, mpsc::UnboundedReceiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (seen_tx, seen) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(echo_once(socket, delay, seen_tx.clone()));
        }
    });
    (addr, seen)
}

/// Local service whose first connection is accepted but never read
async fn stall_first_service() -> (String, mpsc::UnboundedReceiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (seen_tx, seen) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let Ok((_stalled, _)) = listener.accept().await else {
            return;
        };
        let _ = seen_tx.send(Vec::new());
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(echo_once(socket, Duration::ZERO, seen_tx.clone()));
        }
    });
    (addr, seen)
}

async fn echo_once(mut socket: tokio::net::TcpStream, delay: Duration, seen: mpsc::UnboundedSender<Vec<u8>>) {
    let mut request = Vec::new();
    if socket.read_to_end(&mut request).await.is_err() {
        return;
    }
    let _ = seen.send(request.clone());
    tokio::time::sleep(delay).await;
    let _ = socket.write_all(&request).await;
}

/// Send a whole request on `id` and collect the reply
async fn exchange(conn: &mut Conn, id: u32, payload: &[u8]) -> Result<Vec<u8>, ErrorCode> {
    let id = StreamId::new(id);
    conn.send(Frame::new(id, open(5_000))).await.unwrap();
    conn.send(Frame::new(id, Message::Data(payload.to_vec().into())))
        .await
        .unwrap();
    conn.send(Frame::new(id, Message::StreamEnd)).await.unwrap();
    collect(conn, id).await
}

async fn collect(conn: &mut Conn, id: StreamId) -> Result<Vec<u8>, ErrorCode> {
    let mut response = Vec::new();
    loop {
        let frame = next_frame(conn).await;
        if frame.stream_id != id {
            continue;
        }
        match frame.message {
            Message::Data(data) => response.extend_from_slice(&data),
            Message::StreamEnd => return Ok(response),
            Message::StreamReset { code, .. } => return Err(code),
            Message::WindowUpdate { .. } => {}
            other => panic!("unexpected {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_payload_round_trip_is_byte_identical() {
    let local = echo_service(Duration::ZERO).await;
    let h = start(test_config(&local), owner(1), 0);
    let mut conn = h.accept(1).await;

    let payload: Vec<u8> = (0..200_000u32).map(|i| (i * 7 % 256) as u8).collect();
    let response = exchange(&mut conn, 1, &payload).await.unwrap();
    assert_eq!(response, payload);

    h.client.abort();
    h.task.await.unwrap();
}

#[tokio::test]
async fn test_unreachable_local_service_resets_stream() {
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = unused.local_addr().unwrap().to_string();
    drop(unused);

    let h = start(test_config(&addr), owner(1), 0);
    let mut conn = h.accept(1).await;

    assert_eq!(
        exchange(&mut conn, 1, b"hello").await,
        Err(ErrorCode::LocalUnreachable)
    );
    h.client.abort();
}

#[tokio::test]
async fn test_stream_deadline_resets() {
    let local = echo_service(Duration::from_secs(30)).await;
    let h = start(test_config(&local), owner(1), 0);
    let mut conn = h.accept(1).await;

    let id = StreamId::new(3);
    conn.send(Frame::new(id, open(100))).await.unwrap();
    conn.send(Frame::new(id, Message::StreamEnd)).await.unwrap();
    assert_eq!(collect(&mut conn, id).await, Err(ErrorCode::DeadlineExceeded));
    h.client.abort();
}

#[tokio::test]
async fn test_does_not_dial_without_ownership() {
    let local = echo_service(Duration::ZERO).await;
    let h = start(test_config(&local), follower(1), 0);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.dialer.attempts.load(Ordering::SeqCst), 0);
    assert_eq!(h.client.current_state(), TunnelState::Disconnected);

    h.leadership.send_replace(owner(2));
    let _conn = h.accept(2).await;
    h.client.abort();
}

#[tokio::test]
async fn test_dial_failures_retried_with_backoff() {
    let local = echo_service(Duration::ZERO).await;
    let h = start(test_config(&local), owner(1), 2);

    let _conn = h.accept(1).await;
    assert_eq!(h.dialer.attempts.load(Ordering::SeqCst), 3);
    h.client.abort();
}

#[tokio::test]
async fn test_rejected_registration_retried() {
    let local = echo_service(Duration::ZERO).await;
    let h = start(test_config(&local), owner(4), 0);

    let mut first = h.next_dial().await;
    assert!(matches!(next_frame(&mut first).await.message, Message::Register { .. }));
    first
        .send(Frame::control(Message::RegisterAck {
            accepted: false,
            reason: Some("stale term".into()),
            session_id: 0,
        }))
        .await
        .unwrap();

    let _conn = h.accept(4).await;
    assert_eq!(h.dialer.attempts.load(Ordering::SeqCst), 2);
    h.client.abort();
}

#[tokio::test]
async fn test_heartbeat_answered() {
    let local = echo_service(Duration::ZERO).await;
    let h = start(test_config(&local), owner(1), 0);
    let mut conn = h.accept(1).await;

    conn.send(Frame::control(Message::Heartbeat { timestamp: 7 }))
        .await
        .unwrap();
    assert_eq!(
        next_frame(&mut conn).await.message,
        Message::HeartbeatAck { timestamp: 7 }
    );
    h.client.abort();
}

#[tokio::test]
async fn test_leadership_loss_drains_in_flight_streams() {
    let (local, mut seen) = signalling_echo_service(Duration::from_millis(500)).await;
    let h = start(test_config(&local), owner(1), 0);
    let mut conn = h.accept(1).await;

    let slow = StreamId::new(1);
    conn.send(Frame::new(slow, open(5_000))).await.unwrap();
    conn.send(Frame::new(slow, Message::Data("in flight".into())))
        .await
        .unwrap();
    conn.send(Frame::new(slow, Message::StreamEnd)).await.unwrap();

    // Only lose leadership once the request reached the local service
    let request = tokio::time::timeout(Duration::from_secs(5), seen.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(request, b"in flight");
    h.leadership.send_replace(follower(2));

    loop {
        match next_frame(&mut conn).await.message {
            Message::GoAway { reason } => {
                assert_eq!(reason, "leadership lost");
                break;
            }
            Message::WindowUpdate { .. } => {}
            other => panic!("expected GoAway, got {:?}", other),
        }
    }
    assert_eq!(h.client.current_state(), TunnelState::Draining);

    // New streams are refused while draining
    let late = StreamId::new(3);
    conn.send(Frame::new(late, open(5_000))).await.unwrap();
    assert_eq!(collect(&mut conn, late).await, Err(ErrorCode::Refused));

    // The in-flight stream still completes
    assert_eq!(collect(&mut conn, slow).await.unwrap(), b"in flight");
    assert_eq!(h.client.current_state(), TunnelState::Draining);

    // The dispatcher releases the session; the client closes and stays away
    conn.send(Frame::control(Message::GoAway {
        reason: "drained".into(),
    }))
    .await
    .unwrap();
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(Ok(_)) = conn.next().await {}
    })
    .await;
    assert!(closed.is_ok());
    wait_state(&h.client, TunnelState::Disconnected).await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.dialer.attempts.load(Ordering::SeqCst), 1);

    // Regaining leadership in a later term reconnects
    h.leadership.send_replace(owner(3));
    let _conn = h.accept(3).await;
    h.client.abort();
}

#[tokio::test]
async fn test_idle_drain_keeps_reading_until_released() {
    let local = echo_service(Duration::ZERO).await;
    let h = start(test_config(&local), owner(1), 0);
    let mut conn = h.accept(1).await;

    // Nothing in flight when leadership goes
    h.leadership.send_replace(follower(2));
    assert!(matches!(
        next_frame(&mut conn).await.message,
        Message::GoAway { .. }
    ));

    // A stream the dispatcher opened before it saw our GoAway is still answered
    let crossed = StreamId::new(5);
    conn.send(Frame::new(crossed, open(5_000))).await.unwrap();
    assert_eq!(collect(&mut conn, crossed).await, Err(ErrorCode::Refused));
    assert_eq!(h.client.current_state(), TunnelState::Draining);

    conn.send(Frame::control(Message::GoAway {
        reason: "drained".into(),
    }))
    .await
    .unwrap();
    wait_state(&h.client, TunnelState::Disconnected).await;
    h.client.abort();
}

#[tokio::test]
async fn test_drain_bounded_by_grace_when_dispatcher_silent() {
    let local = echo_service(Duration::ZERO).await;
    let mut config = test_config(&local);
    config.tunnel.drain_grace = Duration::from_millis(300);
    let h = start(config, owner(1), 0);
    let mut conn = h.accept(1).await;

    h.client.stop_accepting();
    assert!(matches!(
        next_frame(&mut conn).await.message,
        Message::GoAway { .. }
    ));

    // No answer from the dispatcher: the grace period ends the session
    tokio::time::timeout(Duration::from_secs(3), h.task)
        .await
        .expect("drain not bounded by the grace period")
        .unwrap();
    assert_eq!(h.client.current_state(), TunnelState::Disconnected);
}

#[tokio::test]
async fn test_stop_accepting_sends_go_away_and_exits() {
    let local = echo_service(Duration::ZERO).await;
    let h = start(test_config(&local), owner(1), 0);
    let mut conn = h.accept(1).await;

    h.client.stop_accepting();

    assert!(matches!(
        next_frame(&mut conn).await.message,
        Message::GoAway { .. }
    ));
    conn.send(Frame::control(Message::GoAway {
        reason: "drained".into(),
    }))
    .await
    .unwrap();
    tokio::time::timeout(Duration::from_secs(1), h.task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(h.client.current_state(), TunnelState::Disconnected);
}

#[tokio::test]
async fn test_dispatcher_go_away_triggers_reconnect() {
    let local = echo_service(Duration::ZERO).await;
    let h = start(test_config(&local), owner(1), 0);
    let mut conn = h.accept(1).await;

    conn.send(Frame::control(Message::GoAway {
        reason: "superseded".into(),
    }))
    .await
    .unwrap();

    let _again = h.accept(1).await;
    assert_eq!(h.dialer.attempts.load(Ordering::SeqCst), 2);
    h.client.abort();
}

#[tokio::test]
async fn test_stalled_stream_does_not_block_others() {
    let (local, mut accepted) = stall_first_service().await;
    let mut config = test_config(&local);
    config.tunnel.stream_buffer = 2;
    let h = start(config, owner(1), 0);
    let mut conn = h.accept(1).await;

    // The local service never reads this stream
    let stalled = StreamId::new(1);
    conn.send(Frame::new(stalled, open(10_000))).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), accepted.recv())
        .await
        .unwrap()
        .unwrap();

    // Flood it well past both its window and the socket buffers
    let chunk = bytes::Bytes::from(vec![7u8; 1 << 20]);
    tokio::time::timeout(Duration::from_secs(5), async {
        for _ in 0..24 {
            conn.send(Frame::new(stalled, Message::Data(chunk.clone())))
                .await
                .unwrap();
        }
    })
    .await
    .expect("connector stopped reading the session");

    // The flooded stream was reset for overrunning its window
    assert_eq!(collect(&mut conn, stalled).await, Err(ErrorCode::FlowControl));

    // Another stream on the same session still completes
    let response = tokio::time::timeout(Duration::from_secs(2), exchange(&mut conn, 3, b"still flowing"))
        .await
        .expect("session stalled behind one stream")
        .unwrap();
    assert_eq!(response, b"still flowing");
    h.client.abort();
}

#[tokio::test]
async fn test_reply_waits_for_dispatcher_credit() {
    let local = echo_service(Duration::ZERO).await;
    let mut config = test_config(&local);
    config.tunnel.max_frame_size = 4;
    let h = start(config, owner(1), 0);
    let mut conn = h.accept(1).await;

    let id = StreamId::new(1);
    conn.send(Frame::new(
        id,
        Message::StreamOpen {
            deadline_ms: 5_000,
            window: 1,
        },
    ))
    .await
    .unwrap();
    assert_eq!(
        next_frame(&mut conn).await.message,
        Message::WindowUpdate { increment: 64 }
    );
    conn.send(Frame::new(id, Message::Data("aaaabbbb".into())))
        .await
        .unwrap();
    conn.send(Frame::new(id, Message::StreamEnd)).await.unwrap();

    assert_eq!(next_frame(&mut conn).await.message, Message::Data("aaaa".into()));
    let early = tokio::time::timeout(Duration::from_millis(200), conn.next()).await;
    assert!(early.is_err(), "sent without credit: {:?}", early);

    conn.send(Frame::new(id, Message::WindowUpdate { increment: 1 }))
        .await
        .unwrap();
    assert_eq!(next_frame(&mut conn).await.message, Message::Data("bbbb".into()));
    assert_eq!(next_frame(&mut conn).await.message, Message::StreamEnd);
    h.client.abort();
}

#[tokio::test]
async fn test_consumed_frames_hand_credit_back() {
    let local = echo_service(Duration::from_secs(30)).await;
    let mut config = test_config(&local);
    config.tunnel.stream_buffer = 2;
    let h = start(config, owner(1), 0);
    let mut conn = h.accept(1).await;

    let id = StreamId::new(1);
    conn.send(Frame::new(id, open(5_000))).await.unwrap();
    assert_eq!(
        next_frame(&mut conn).await.message,
        Message::WindowUpdate { increment: 2 }
    );

    conn.send(Frame::new(id, Message::Data("one".into())))
        .await
        .unwrap();
    let update = next_frame(&mut conn).await;
    assert_eq!(update.stream_id, id);
    assert_eq!(update.message, Message::WindowUpdate { increment: 1 });
    h.client.abort();
}
