//! Dispatcher side of one stream

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use wh_core::{DispatchError, SessionId};
use wh_protocol::{ErrorCode, Frame, Message, StreamId};

use super::{Inbound, Session};

/// One request/response exchange over the active session.
///
/// A stream resolves exactly once: the connector ends it, resets it, the
/// deadline passes, or the session goes away. After that [`Stream::recv`]
/// keeps returning the same outcome. Dropping an unresolved stream resets
/// it on the connector side and frees its slot.
///
/// Sending needs credit from the connector, which it grants as it consumes
/// what we sent. Reading hands credit back the same way.
pub struct Stream {
    id: StreamId,
    session: Arc<Session>,
    inbound: mpsc::Receiver<Inbound>,
    credit: Arc<Semaphore>,
    /// `Data` frames read but not yet handed back as credit
    unacked: u32,
    deadline: Instant,
    outcome: Option<Result<(), DispatchError>>,
    finished: bool,
    _permit: OwnedSemaphorePermit,
}

impl Stream {
    pub(crate) fn new(
        id: StreamId,
        session: Arc<Session>,
        inbound: mpsc::Receiver<Inbound>,
        credit: Arc<Semaphore>,
        permit: OwnedSemaphorePermit,
        deadline: Duration,
    ) -> Self {
        Self {
            id,
            session,
            inbound,
            credit,
            unacked: 0,
            deadline: Instant::now() + deadline,
            outcome: None,
            finished: false,
            _permit: permit,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn session_id(&self) -> SessionId {
        self.session.id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Terminal outcome, once resolved
    pub fn outcome(&self) -> Option<&Result<(), DispatchError>> {
        self.outcome.as_ref()
    }

    /// Send payload bytes, split into frames of at most `max_frame_size`.
    ///
    /// Waits for window credit, so a caller that also expects a reply to
    /// arrive while it is still sending should use [`Stream::exchange`].
    pub async fn send(&mut self, data: &[u8]) -> Result<(), DispatchError> {
        self.check_open()?;
        for chunk in data.chunks(self.session.limits.max_frame_size.max(1)) {
            self.take_credit().await?;
            self.push(Bytes::copy_from_slice(chunk)).await?;
        }
        Ok(())
    }

    /// Half-close: no more data from this side
    pub async fn finish(&mut self) -> Result<(), DispatchError> {
        if self.finished {
            return Ok(());
        }
        if let Some(Err(e)) = &self.outcome {
            return Err(e.clone());
        }
        self.send_frame(Frame::new(self.id, Message::StreamEnd)).await?;
        self.finished = true;
        Ok(())
    }

    /// Next chunk from the connector; `Ok(None)` once it ended the stream
    pub async fn recv(&mut self) -> Result<Option<Bytes>, DispatchError> {
        if let Some(outcome) = &self.outcome {
            return outcome.clone().map(|_| None);
        }

        let event = loop {
            let owed = self.unacked >= self.credit_batch();
            tokio::select! {
                biased;
                event = self.inbound.recv() => break Some(event),
                _ = self.session.closed() => break Some(None),
                _ = tokio::time::sleep_until(self.deadline) => break None,
                permit = self.session.outbound.reserve(), if owed => {
                    if let Ok(permit) = permit {
                        permit.send(window_update(self.id, self.unacked));
                        self.unacked = 0;
                    }
                }
            }
        };
        // `None` marks the deadline firing; expire outside the select borrows
        let Some(event) = event else {
            return Err(self.expire());
        };

        match event {
            Some(Inbound::Data(data)) => {
                self.consumed();
                Ok(Some(data))
            }
            Some(Inbound::End) => {
                self.resolve(Ok(()));
                Ok(None)
            }
            Some(Inbound::Reset { code, message }) => {
                let err = match code {
                    ErrorCode::DeadlineExceeded => DispatchError::DeadlineExceeded,
                    ErrorCode::Cancelled => DispatchError::Cancelled(message),
                    code => DispatchError::Remote { code, message },
                };
                Err(self.resolve(Err(err)))
            }
            None if self.session.is_closed() => Err(self.resolve(Err(self.session.cancelled()))),
            // Routing dropped us for overrunning the window it granted
            None => Err(self.resolve(Err(DispatchError::Remote {
                code: ErrorCode::FlowControl,
                message: "receive window exceeded".into(),
            }))),
        }
    }

    /// Read until the connector ends the stream, up to `max` bytes
    pub async fn collect(&mut self, max: usize) -> Result<Bytes, DispatchError> {
        let mut out = Vec::new();
        while let Some(chunk) = self.recv().await? {
            self.append(&mut out, chunk, max)?;
        }
        Ok(Bytes::from(out))
    }

    /// Send `payload`, half-close and collect the reply, reading while
    /// still sending so a service that answers early cannot stall on us.
    pub async fn exchange(&mut self, payload: &[u8], max: usize) -> Result<Bytes, DispatchError> {
        self.check_open()?;
        let credit = Arc::clone(&self.credit);
        let mut chunks = payload.chunks(self.session.limits.max_frame_size.max(1));
        let mut pending = chunks.next();
        if pending.is_none() {
            self.finish().await?;
        }

        let mut out = Vec::new();
        loop {
            tokio::select! {
                biased;
                chunk = self.recv() => match chunk? {
                    Some(data) => self.append(&mut out, data, max)?,
                    None => return Ok(Bytes::from(out)),
                },
                permit = credit.acquire(), if pending.is_some() => {
                    // A closed window means the stream is being torn down;
                    // recv reports how
                    let Ok(permit) = permit else {
                        pending = None;
                        continue;
                    };
                    permit.forget();
                    if let Some(chunk) = pending.take() {
                        self.push(Bytes::copy_from_slice(chunk)).await?;
                    }
                    pending = chunks.next();
                    if pending.is_none() {
                        self.finish().await?;
                    }
                }
            }
        }
    }

    /// Send credit handle for relays that interleave reads and writes
    pub(crate) fn credit(&self) -> Arc<Semaphore> {
        Arc::clone(&self.credit)
    }

    /// Send one `Data` frame; the caller already took its credit
    pub(crate) async fn push(&mut self, chunk: Bytes) -> Result<(), DispatchError> {
        self.check_open()?;
        self.send_frame(Frame::new(self.id, Message::Data(chunk))).await
    }

    fn check_open(&self) -> Result<(), DispatchError> {
        if let Some(Err(e)) = &self.outcome {
            return Err(e.clone());
        }
        if self.finished {
            return Err(DispatchError::Cancelled("stream already finished".into()));
        }
        Ok(())
    }

    async fn take_credit(&mut self) -> Result<(), DispatchError> {
        let credit = Arc::clone(&self.credit);
        match tokio::time::timeout_at(self.deadline, credit.acquire_owned()).await {
            Ok(Ok(permit)) => {
                permit.forget();
                Ok(())
            }
            Ok(Err(_)) if self.session.is_closed() => Err(self.resolve(Err(self.session.cancelled()))),
            // Ended or reset by the connector; recv still has its answer
            Ok(Err(_)) => Err(DispatchError::Cancelled("stream closed by connector".into())),
            Err(_) => Err(self.expire()),
        }
    }

    fn append(&mut self, out: &mut Vec<u8>, chunk: Bytes, max: usize) -> Result<(), DispatchError> {
        if out.len() + chunk.len() > max {
            self.session.try_send(Frame::new(
                self.id,
                Message::StreamReset {
                    code: ErrorCode::Cancelled,
                    message: "response too large".into(),
                },
            ));
            return Err(self.resolve(Err(DispatchError::TooLarge { max })));
        }
        out.extend_from_slice(&chunk);
        Ok(())
    }

    /// Count one consumed frame and hand credit back once a batch built up
    fn consumed(&mut self) {
        self.unacked += 1;
        if self.unacked >= self.credit_batch()
            && self
                .session
                .outbound
                .try_send(window_update(self.id, self.unacked))
                .is_ok()
        {
            self.unacked = 0;
        }
    }

    fn credit_batch(&self) -> u32 {
        (self.session.limits.window() / 2).max(1)
    }

    fn expire(&mut self) -> DispatchError {
        self.session.try_send(Frame::new(
            self.id,
            Message::StreamReset {
                code: ErrorCode::DeadlineExceeded,
                message: "deadline exceeded".into(),
            },
        ));
        self.resolve(Err(DispatchError::DeadlineExceeded))
    }

    async fn send_frame(&mut self, frame: Frame) -> Result<(), DispatchError> {
        match tokio::time::timeout_at(self.deadline, self.session.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(self.resolve(Err(e))),
            Err(_) => Err(self.expire()),
        }
    }

    /// Record the terminal outcome. Only the first call has any effect.
    fn resolve(&mut self, outcome: Result<(), DispatchError>) -> DispatchError {
        if self.outcome.is_none() {
            if let Err(e) = &outcome {
                tracing::debug!(session = %self.session.id, stream = %self.id, error = %e, "Stream failed");
            }
            self.outcome = Some(outcome);
            self.session.remove_stream(self.id);
        }
        match &self.outcome {
            Some(Err(e)) => e.clone(),
            _ => DispatchError::Cancelled("stream already ended".into()),
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        let abandoned = match &self.outcome {
            None => true,
            Some(Ok(())) => !self.finished,
            Some(Err(_)) => false,
        };
        if abandoned {
            self.session.try_send(Frame::new(
                self.id,
                Message::StreamReset {
                    code: ErrorCode::Cancelled,
                    message: "stream abandoned".into(),
                },
            ));
        }
        self.session.remove_stream(self.id);
    }
}

fn window_update(id: StreamId, increment: u32) -> Frame {
    Frame::new(id, Message::WindowUpdate { increment })
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("session", &self.session.id)
            .field("outcome", &self.outcome)
            .finish()
    }
}
