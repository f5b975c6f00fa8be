//! Tunnel client errors

use std::time::Duration;

use thiserror::Error;
use wh_core::TransportError;
use wh_protocol::ProtocolError;

/// Why a dial, registration or session ended
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Dial or TLS failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Malformed frame on the tunnel
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The dispatcher refused the registration
    #[error("Registration rejected: {reason}")]
    Rejected { reason: String },

    /// No `RegisterAck` in time
    #[error("No registration acknowledgment within {0:?}")]
    RegisterTimeout(Duration),

    /// Nothing heard from the dispatcher for too long
    #[error("Session idle for {0:?}")]
    Idle(Duration),

    /// The dispatcher closed the connection
    #[error("Connection closed by dispatcher")]
    Closed,

    /// The dispatcher ended the session with `GoAway`
    #[error("Dispatcher ended the session: {reason}")]
    GoAway { reason: String },

    /// The dispatcher reported a session-level error
    #[error("Dispatcher error: {0}")]
    Remote(String),
}
