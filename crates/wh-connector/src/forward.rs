//! Relay of one stream to the local service

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use wh_protocol::{ErrorCode, Frame, Message, StreamId};

/// Upper bound for streams opened without a deadline
const MAX_STREAM_DEADLINE: Duration = Duration::from_secs(24 * 60 * 60);

/// Frames from the dispatcher for one stream
#[derive(Debug)]
pub(crate) enum Inbound {
    Data(Bytes),
    End,
    Reset,
}

/// Why a stream did not complete
enum Failure {
    /// Report to the dispatcher with `StreamReset`
    Reset(ErrorCode, String),
    /// The dispatcher side is already gone
    Silent,
}

/// Everything a forwarding task needs besides its channels
#[derive(Debug, Clone)]
pub(crate) struct ForwardTarget {
    pub local_addr: String,
    pub max_frame_size: usize,
}

/// Per-stream plumbing handed over by the session loop
pub(crate) struct StreamIo {
    pub inbound: mpsc::Receiver<Inbound>,
    /// `Data` frames the dispatcher still lets us send
    pub credit: Arc<Semaphore>,
    /// Receive window we granted; consumed frames are handed back in batches
    pub window: u32,
    pub outbound: mpsc::Sender<Frame>,
}

/// Connect to the local service and relay bytes until it closes its side.
///
/// Returns the stream id so the session loop can forget the stream.
pub(crate) async fn forward_stream(
    id: StreamId,
    target: ForwardTarget,
    deadline_ms: u64,
    io: StreamIo,
    cancel: CancellationToken,
) -> StreamId {
    let deadline = match deadline_ms {
        0 => MAX_STREAM_DEADLINE,
        ms => Duration::from_millis(ms).min(MAX_STREAM_DEADLINE),
    };
    let deadline = Instant::now() + deadline;
    let outbound = io.outbound.clone();

    let result = tokio::select! {
        _ = cancel.cancelled() => Err(Failure::Reset(ErrorCode::Cancelled, "connector shutting down".into())),
        result = tokio::time::timeout_at(deadline, relay(id, &target, io)) => {
            result.unwrap_or_else(|_| {
                Err(Failure::Reset(ErrorCode::DeadlineExceeded, "deadline exceeded".into()))
            })
        }
    };

    match result {
        Ok(()) => tracing::debug!(stream = %id, "Stream completed"),
        Err(Failure::Reset(code, message)) => {
            tracing::debug!(stream = %id, ?code, %message, "Stream failed");
            let _ = outbound
                .send(Frame::new(id, Message::StreamReset { code, message }))
                .await;
        }
        Err(Failure::Silent) => tracing::debug!(stream = %id, "Stream abandoned by dispatcher"),
    }
    id
}

/// Both directions run side by side; the stream is done once the local
/// service closes its side.
async fn relay(id: StreamId, target: &ForwardTarget, io: StreamIo) -> Result<(), Failure> {
    let tcp = TcpStream::connect(&target.local_addr).await.map_err(|e| {
        Failure::Reset(
            ErrorCode::LocalUnreachable,
            format!("{}: {}", target.local_addr, e),
        )
    })?;
    let _ = tcp.set_nodelay(true);
    let (reader, writer) = tcp.into_split();

    let StreamIo {
        inbound,
        credit,
        window,
        outbound,
    } = io;
    let upstream = to_local(id, writer, inbound, window, &outbound);
    let downstream = from_local(id, reader, &credit, target.max_frame_size, &outbound);
    tokio::pin!(upstream, downstream);

    tokio::select! {
        failure = &mut upstream => Err(failure),
        result = &mut downstream => result,
    }
}

/// Dispatcher to local service. Keeps listening after `StreamEnd` so a
/// later reset still aborts the stream; only ever returns a failure.
async fn to_local(
    id: StreamId,
    mut writer: OwnedWriteHalf,
    mut inbound: mpsc::Receiver<Inbound>,
    window: u32,
    outbound: &mpsc::Sender<Frame>,
) -> Failure {
    let batch = (window / 2).max(1);
    let mut unacked = 0u32;
    let mut request_open = true;

    loop {
        match inbound.recv().await {
            Some(Inbound::Data(data)) if request_open => {
                if let Err(e) = writer.write_all(&data).await {
                    return io_failure(e);
                }
                unacked += 1;
                if unacked >= batch {
                    let update = Frame::new(id, Message::WindowUpdate { increment: unacked });
                    if outbound.send(update).await.is_err() {
                        return Failure::Silent;
                    }
                    unacked = 0;
                }
            }
            Some(Inbound::Data(_)) => {}
            Some(Inbound::End) if request_open => {
                request_open = false;
                if let Err(e) = writer.shutdown().await {
                    return io_failure(e);
                }
            }
            Some(Inbound::End) => {}
            Some(Inbound::Reset) | None => return Failure::Silent,
        }
    }
}

/// Local service to dispatcher, one `Data` frame per unit of credit
async fn from_local(
    id: StreamId,
    mut reader: OwnedReadHalf,
    credit: &Semaphore,
    max_frame_size: usize,
    outbound: &mpsc::Sender<Frame>,
) -> Result<(), Failure> {
    let mut buf = vec![0u8; max_frame_size.max(1)];
    loop {
        let n = reader.read(&mut buf).await.map_err(io_failure)?;
        let message = if n == 0 {
            Message::StreamEnd
        } else {
            credit.acquire().await.map_err(|_| Failure::Silent)?.forget();
            Message::Data(Bytes::copy_from_slice(&buf[..n]))
        };
        outbound
            .send(Frame::new(id, message))
            .await
            .map_err(|_| Failure::Silent)?;
        if n == 0 {
            return Ok(());
        }
    }
}

fn io_failure(e: std::io::Error) -> Failure {
    Failure::Reset(ErrorCode::Unknown, e.to_string())
}
