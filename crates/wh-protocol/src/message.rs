//! Message types for the wormhole tunnel protocol
//!
//! Messages are serialized with bincode and wrapped in frames by the codec
//! defined in `codec.rs`.
//!
//! # Message Flow
//!
//! 1. Connector dials, completes TLS and sends `Register` with its node id
//!    and the consensus term it won
//! 2. Dispatcher validates the term and answers `RegisterAck`
//! 3. Dispatcher sends `Heartbeat` periodically, connector answers `HeartbeatAck`
//! 4. For each external request the dispatcher sends `StreamOpen` carrying
//!    its receive window, then request bytes as `Data`, then `StreamEnd`
//! 5. The connector accepts with `WindowUpdate` (its own receive window) and
//!    answers on the same stream with `Data` frames followed by `StreamEnd`,
//!    or `StreamReset` if the local destination failed
//! 6. A connector that lost leadership sends `GoAway`, finishes in-flight
//!    streams and waits for the dispatcher's `GoAway` before closing
//!
//! # Flow Control
//!
//! Windows count `Data` frames, not bytes. A side may only send a `Data`
//! frame while it holds credit from the peer; every `WindowUpdate` grants
//! `increment` more. A receiver returns credit once the frames have been
//! consumed, so one slow stream never holds up the rest of the session.
//! Sending beyond the window earns a `StreamReset` with `FlowControl`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Current protocol version string, sent in `Register`.
///
/// Format: "MAJOR.MINOR" where MAJOR changes indicate breaking changes.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Message type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Registration (connector → dispatcher)
    Register = 0x01,
    /// Registration acknowledgment
    RegisterAck = 0x02,
    /// Open a new stream
    StreamOpen = 0x03,
    /// Stream payload bytes
    Data = 0x04,
    /// Half-close of one direction of a stream
    StreamEnd = 0x05,
    /// Abort a stream with an error
    StreamReset = 0x06,
    /// Heartbeat ping
    Heartbeat = 0x07,
    /// Heartbeat acknowledgment
    HeartbeatAck = 0x08,
    /// Sender stops accepting new streams
    GoAway = 0x09,
    /// Grant more send credit on a stream
    WindowUpdate = 0x0A,
    /// Session-level error
    Error = 0xFF,
}

/// Which stream ids may carry a message type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Session-level: only on [`StreamId::CONTROL`](crate::StreamId::CONTROL)
    Session,
    /// Only on a real stream, never on the control stream
    Stream,
    /// Either
    Any,
}

impl MessageType {
    /// Where this type of message may travel
    pub fn scope(&self) -> Scope {
        match self {
            Self::Register | Self::RegisterAck | Self::Heartbeat | Self::HeartbeatAck | Self::GoAway => {
                Scope::Session
            }
            Self::StreamOpen | Self::Data | Self::StreamEnd | Self::StreamReset | Self::WindowUpdate => {
                Scope::Stream
            }
            Self::Error => Scope::Any,
        }
    }

    /// Convert to u8
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Register),
            0x02 => Some(Self::RegisterAck),
            0x03 => Some(Self::StreamOpen),
            0x04 => Some(Self::Data),
            0x05 => Some(Self::StreamEnd),
            0x06 => Some(Self::StreamReset),
            0x07 => Some(Self::Heartbeat),
            0x08 => Some(Self::HeartbeatAck),
            0x09 => Some(Self::GoAway),
            0x0A => Some(Self::WindowUpdate),
            0xFF => Some(Self::Error),
            _ => None,
        }
    }
}

/// Error codes carried by `StreamReset` and `Error`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    /// Unknown error
    Unknown = 0,
    /// Stream not found
    StreamNotFound = 1,
    /// Local destination could not be reached
    LocalUnreachable = 2,
    /// Stream deadline passed before completion
    DeadlineExceeded = 3,
    /// Sender is draining and refuses new streams
    Refused = 4,
    /// Stream was cancelled (shutdown or session loss)
    Cancelled = 5,
    /// Invalid message
    InvalidMessage = 6,
    /// Registration rejected: sender is not the current leader
    NotLeader = 7,
    /// Peer sent more `Data` than the receive window allowed
    FlowControl = 8,
}

/// Protocol messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Connector registration.
    Register {
        /// Cluster node id of the connector
        node_id: String,
        /// Consensus term in which the connector holds leadership
        term: u64,
        /// Protocol version (`PROTOCOL_VERSION`)
        version: String,
    },

    /// Registration acknowledgment
    RegisterAck {
        /// Whether registration was accepted
        accepted: bool,
        /// Reason if not accepted
        reason: Option<String>,
        /// Session id assigned by the dispatcher (0 if rejected)
        session_id: u64,
    },

    /// Open a stream
    StreamOpen {
        /// Milliseconds the receiver has to complete the stream
        deadline_ms: u64,
        /// `Data` frames the opener is ready to receive before it returns credit
        window: u32,
    },

    /// Stream payload
    Data(Bytes),

    /// No more data in this direction
    StreamEnd,

    /// Abort the stream
    StreamReset {
        /// Error code
        code: ErrorCode,
        /// Human-readable message
        message: String,
    },

    /// Heartbeat ping
    Heartbeat {
        /// Timestamp for latency measurement
        timestamp: u64,
    },

    /// Heartbeat acknowledgment
    HeartbeatAck {
        /// Echo of the original timestamp
        timestamp: u64,
    },

    /// The sender will not accept new streams on this session
    GoAway {
        /// Why the sender is going away
        reason: String,
    },

    /// Grant the peer credit for `increment` more `Data` frames
    WindowUpdate {
        /// Additional frames the receiver is ready for
        increment: u32,
    },

    /// Session-level error
    Error {
        /// Error code
        code: ErrorCode,
        /// Human-readable message
        message: String,
    },
}

impl Message {
    /// Get the message type for this message
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Register { .. } => MessageType::Register,
            Message::RegisterAck { .. } => MessageType::RegisterAck,
            Message::StreamOpen { .. } => MessageType::StreamOpen,
            Message::Data(_) => MessageType::Data,
            Message::StreamEnd => MessageType::StreamEnd,
            Message::StreamReset { .. } => MessageType::StreamReset,
            Message::Heartbeat { .. } => MessageType::Heartbeat,
            Message::HeartbeatAck { .. } => MessageType::HeartbeatAck,
            Message::GoAway { .. } => MessageType::GoAway,
            Message::WindowUpdate { .. } => MessageType::WindowUpdate,
            Message::Error { .. } => MessageType::Error,
        }
    }

    /// Whether this message ends one direction of a stream
    pub fn is_terminal(&self) -> bool {
        matches!(self, Message::StreamEnd | Message::StreamReset { .. })
    }
}
