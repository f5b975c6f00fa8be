//! Wire-level failures

use thiserror::Error;

use crate::message::{ErrorCode, MessageType};
use crate::stream::StreamId;

/// A frame could not be read or written.
///
/// Everything except `Io` means the peer broke the protocol; the session
/// carrying it cannot be trusted any further.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("unknown message type 0x{tag:02x}")]
    UnknownType { tag: u8 },

    /// A session-level message on a stream, or a stream message on the
    /// control stream
    #[error("{message_type:?} is not allowed on {stream_id}")]
    Misrouted {
        stream_id: StreamId,
        message_type: MessageType,
    },

    #[error("frame payload of {size} bytes exceeds the {max} byte limit")]
    Oversized { size: usize, max: usize },

    /// Header announced one message type, payload decoded as another
    #[error("header announced {header:?} but payload is {payload:?}")]
    TypeMismatch {
        header: MessageType,
        payload: MessageType,
    },

    #[error("malformed payload: {0}")]
    Malformed(#[from] bincode::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Code to report to the peer before dropping the session
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Io(_) => ErrorCode::Unknown,
            _ => ErrorCode::InvalidMessage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violations_map_to_invalid_message() {
        let misrouted = ProtocolError::Misrouted {
            stream_id: StreamId::CONTROL,
            message_type: MessageType::Data,
        };
        assert_eq!(misrouted.code(), ErrorCode::InvalidMessage);
        assert_eq!(misrouted.to_string(), "Data is not allowed on stream-0");
        assert_eq!(ProtocolError::UnknownType { tag: 0xfe }.to_string(), "unknown message type 0xfe");

        let io = ProtocolError::from(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert_eq!(io.code(), ErrorCode::Unknown);
    }
}
