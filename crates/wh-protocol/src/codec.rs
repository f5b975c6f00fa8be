//! Tokio codec for framed protocol messages

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::frame::{FrameHeader, HEADER_SIZE, MAX_PAYLOAD_SIZE};
use crate::message::Message;
use crate::stream::StreamId;

/// A complete frame with header and payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Stream this frame belongs to
    pub stream_id: StreamId,
    /// The message payload
    pub message: Message,
}

impl Frame {
    /// Create a new frame
    pub fn new(stream_id: StreamId, message: Message) -> Self {
        Self { stream_id, message }
    }

    /// Create a frame on the control stream
    pub fn control(message: Message) -> Self {
        Self::new(StreamId::CONTROL, message)
    }
}

/// Codec for encoding/decoding protocol frames
#[derive(Debug)]
pub struct FrameCodec {
    /// Current header being decoded (if any)
    pending_header: Option<FrameHeader>,
    /// Largest payload accepted in either direction
    max_payload: usize,
}

impl FrameCodec {
    /// Create a new codec accepting payloads up to the protocol maximum
    pub fn new() -> Self {
        Self::with_max_payload(MAX_PAYLOAD_SIZE)
    }

    /// Create a codec with a tighter payload limit
    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            pending_header: None,
            max_payload: max_payload.min(MAX_PAYLOAD_SIZE),
        }
    }

    /// The payload limit this codec enforces
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match self.pending_header.take() {
            Some(h) => h,
            None => {
                if src.len() < HEADER_SIZE {
                    return Ok(None);
                }
                let mut raw = [0u8; HEADER_SIZE];
                raw.copy_from_slice(&src[..HEADER_SIZE]);
                let header = FrameHeader::parse(raw)?;
                if header.payload_length as usize > self.max_payload {
                    return Err(ProtocolError::Oversized {
                        size: header.payload_length as usize,
                        max: self.max_payload,
                    });
                }
                src.advance(HEADER_SIZE);
                header
            }
        };

        let payload_len = header.payload_length as usize;
        if src.len() < payload_len {
            src.reserve(payload_len - src.len());
            self.pending_header = Some(header);
            return Ok(None);
        }

        let payload_bytes = src.split_to(payload_len).freeze();
        let message: Message = bincode::deserialize(&payload_bytes)?;

        if message.message_type() != header.message_type {
            return Err(ProtocolError::TypeMismatch {
                header: header.message_type,
                payload: message.message_type(),
            });
        }

        Ok(Some(Frame {
            stream_id: header.stream_id,
            message,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = bincode::serialize(&frame.message)?;
        if payload.len() > self.max_payload {
            return Err(ProtocolError::Oversized {
                size: payload.len(),
                max: self.max_payload,
            });
        }

        let header = FrameHeader::outgoing(frame.stream_id, frame.message.message_type(), payload.len())?;
        dst.reserve(HEADER_SIZE + payload.len());
        dst.extend_from_slice(&header.to_bytes());
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ErrorCode;
    use bytes::Bytes;

    #[test]
    fn test_codec_register() {
        let mut codec = FrameCodec::new();

        let frame = Frame::control(Message::Register {
            node_id: "10.0.0.2:1111".to_string(),
            term: 7,
            version: crate::PROTOCOL_VERSION.to_string(),
        });

        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_codec_data_message() {
        let mut codec = FrameCodec::new();

        let frame = Frame::new(StreamId::new(42), Message::Data(Bytes::from("Hello, world!")));

        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.stream_id, StreamId::new(42));

        if let Message::Data(data) = decoded.message {
            assert_eq!(data.as_ref(), b"Hello, world!");
        } else {
            panic!("Expected Data message");
        }
    }

    #[test]
    fn test_codec_partial_read() {
        let mut codec = FrameCodec::new();

        let frame = Frame::control(Message::Heartbeat { timestamp: 12345 });

        let mut full_buf = BytesMut::new();
        codec.encode(frame, &mut full_buf).unwrap();

        let mut partial = full_buf.split_to(HEADER_SIZE - 1);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full_buf);

        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded.message, Message::Heartbeat { timestamp: 12345 });
    }

    #[test]
    fn test_codec_payload_split_after_header() {
        let mut codec = FrameCodec::new();
        let frame = Frame::new(
            StreamId::new(3),
            Message::StreamReset {
                code: ErrorCode::LocalUnreachable,
                message: "connection refused".to_string(),
            },
        );

        let mut full_buf = BytesMut::new();
        codec.encode(frame.clone(), &mut full_buf).unwrap();

        // Header plus a single payload byte: header is parked, nothing decoded
        let mut partial = full_buf.split_to(HEADER_SIZE + 1);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full_buf);
        assert_eq!(codec.decode(&mut partial).unwrap().unwrap(), frame);
    }

    #[test]
    fn test_codec_rejects_oversized_payload() {
        let mut codec = FrameCodec::with_max_payload(16);
        let frame = Frame::new(StreamId::new(1), Message::Data(Bytes::from(vec![0u8; 64])));

        let mut buf = BytesMut::new();
        let result = codec.encode(frame, &mut buf);
        assert!(matches!(result, Err(ProtocolError::Oversized { max: 16, .. })));
    }

    #[test]
    fn test_codec_multiple_frames_in_one_buffer() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        for i in 1..=3u32 {
            codec
                .encode(Frame::new(StreamId::new(i), Message::StreamEnd), &mut buf)
                .unwrap();
        }

        for i in 1..=3u32 {
            let frame = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(frame.stream_id, StreamId::new(i));
            assert_eq!(frame.message, Message::StreamEnd);
        }
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_codec_rejects_oversized_header_before_payload_arrives() {
        let mut codec = FrameCodec::with_max_payload(16);
        // Header only: announced length 64 is refused without waiting for it
        let mut buf = BytesMut::from(&[0, 0, 0, 1, 0x04, 0, 0, 64][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::Oversized { size: 64, max: 16 })
        ));
    }

    #[test]
    fn test_codec_refuses_misrouted_frames() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        let data_on_control = Frame::control(Message::Data(Bytes::from_static(b"x")));
        assert!(matches!(
            codec.encode(data_on_control, &mut buf),
            Err(ProtocolError::Misrouted { .. })
        ));
        let go_away_on_stream = Frame::new(StreamId::new(5), Message::GoAway { reason: "bye".into() });
        assert!(matches!(
            codec.encode(go_away_on_stream, &mut buf),
            Err(ProtocolError::Misrouted { .. })
        ));
        assert!(buf.is_empty());

        // Same violation arriving from a peer
        let payload = bincode::serialize(&Message::WindowUpdate { increment: 1 }).unwrap();
        buf.extend_from_slice(&[0, 0, 0, 0, 0x0A, 0, 0, payload.len() as u8]);
        buf.extend_from_slice(&payload);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::Misrouted { message_type: crate::MessageType::WindowUpdate, .. })
        ));
    }

    #[test]
    fn test_codec_window_update() {
        let mut codec = FrameCodec::new();
        let frame = Frame::new(StreamId::new(2), Message::WindowUpdate { increment: 32 });
        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), frame);
    }
}
