//! Fixed-size frame header
//!
//! ```text
//!  0                   4         5                    8
//!  +-------------------+---------+--------------------+
//!  | stream id (u32)   | type    | payload len (u24)  |
//!  +-------------------+---------+--------------------+
//! ```
//!
//! Integers are big-endian. Stream 0 is the control stream: it carries the
//! session-level messages and nothing else, and those messages never appear
//! on any other stream. A header that breaks this is rejected before its
//! payload is read.

use crate::error::ProtocolError;
use crate::message::{MessageType, Scope};
use crate::stream::StreamId;

pub const HEADER_SIZE: usize = 8;

/// Largest payload the 24-bit length field can describe
pub const MAX_PAYLOAD_SIZE: usize = (1 << 24) - 1;

/// Routing and length information ahead of every payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub stream_id: StreamId,
    pub message_type: MessageType,
    pub payload_length: u32,
}

impl FrameHeader {
    /// Header for an outgoing payload.
    ///
    /// Fails when `stream_id` may not carry `message_type` or the payload
    /// does not fit the length field.
    pub fn outgoing(
        stream_id: StreamId,
        message_type: MessageType,
        payload_length: usize,
    ) -> Result<Self, ProtocolError> {
        if payload_length > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::Oversized {
                size: payload_length,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        check_route(stream_id, message_type)?;
        Ok(Self {
            stream_id,
            message_type,
            payload_length: payload_length as u32,
        })
    }

    /// Parse and validate a received header
    pub fn parse(raw: [u8; HEADER_SIZE]) -> Result<Self, ProtocolError> {
        let [s0, s1, s2, s3, tag, l0, l1, l2] = raw;
        let stream_id = StreamId::new(u32::from_be_bytes([s0, s1, s2, s3]));
        let message_type = MessageType::from_u8(tag).ok_or(ProtocolError::UnknownType { tag })?;
        check_route(stream_id, message_type)?;
        Ok(Self {
            stream_id,
            message_type,
            payload_length: u32::from_be_bytes([0, l0, l1, l2]),
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let [s0, s1, s2, s3] = self.stream_id.as_u32().to_be_bytes();
        let [_, l0, l1, l2] = self.payload_length.to_be_bytes();
        [s0, s1, s2, s3, self.message_type.as_u8(), l0, l1, l2]
    }
}

fn check_route(stream_id: StreamId, message_type: MessageType) -> Result<(), ProtocolError> {
    let allowed = match message_type.scope() {
        Scope::Session => stream_id.is_control(),
        Scope::Stream => !stream_id.is_control(),
        Scope::Any => true,
    };
    if allowed {
        Ok(())
    } else {
        Err(ProtocolError::Misrouted {
            stream_id,
            message_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_is_big_endian() {
        let header = FrameHeader::outgoing(StreamId::new(0x0102_0304), MessageType::Data, 0x05_0607).unwrap();
        assert_eq!(header.to_bytes(), [1, 2, 3, 4, 0x04, 5, 6, 7]);
        assert_eq!(FrameHeader::parse(header.to_bytes()).unwrap(), header);
    }

    #[test]
    fn test_length_field_limit() {
        let max = FrameHeader::outgoing(StreamId::new(1), MessageType::Data, MAX_PAYLOAD_SIZE).unwrap();
        assert_eq!(max.to_bytes()[5..], [0xFF, 0xFF, 0xFF]);

        let over = FrameHeader::outgoing(StreamId::new(1), MessageType::Data, MAX_PAYLOAD_SIZE + 1);
        assert!(matches!(over, Err(ProtocolError::Oversized { .. })));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let result = FrameHeader::parse([0, 0, 0, 1, 0xFE, 0, 0, 10]);
        assert!(matches!(result, Err(ProtocolError::UnknownType { tag: 0xFE })));
    }

    #[test]
    fn test_stream_messages_rejected_on_control_stream() {
        for tag in [0x03u8, 0x04, 0x05, 0x06, 0x0A] {
            let result = FrameHeader::parse([0, 0, 0, 0, tag, 0, 0, 1]);
            assert!(
                matches!(result, Err(ProtocolError::Misrouted { stream_id, .. }) if stream_id.is_control()),
                "type 0x{:02x} accepted on the control stream",
                tag
            );
        }
    }

    #[test]
    fn test_session_messages_rejected_on_streams() {
        for tag in [0x01u8, 0x02, 0x07, 0x08, 0x09] {
            let result = FrameHeader::parse([0, 0, 0, 7, tag, 0, 0, 1]);
            assert!(
                matches!(result, Err(ProtocolError::Misrouted { stream_id, .. }) if stream_id == StreamId::new(7)),
                "type 0x{:02x} accepted on a stream",
                tag
            );
        }

        let outgoing = FrameHeader::outgoing(StreamId::new(7), MessageType::Heartbeat, 8);
        assert!(matches!(outgoing, Err(ProtocolError::Misrouted { .. })));
    }

    #[test]
    fn test_error_allowed_anywhere() {
        assert!(FrameHeader::parse([0, 0, 0, 0, 0xFF, 0, 0, 1]).is_ok());
        assert!(FrameHeader::parse([0, 0, 0, 9, 0xFF, 0, 0, 1]).is_ok());
    }
}
