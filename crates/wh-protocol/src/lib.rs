//! wh-protocol: Wire protocol for wormhole stream multiplexing
//!
//! This crate defines the binary protocol spoken between the dispatcher and
//! the connector that currently owns the tunnel. A single TLS connection
//! carries one session; every external request travels on its own stream
//! inside that session.

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;
pub mod stream;

pub use codec::{Frame, FrameCodec};
pub use error::ProtocolError;
pub use frame::{FrameHeader, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use message::{ErrorCode, Message, MessageType, Scope, PROTOCOL_VERSION};
pub use stream::StreamId;
