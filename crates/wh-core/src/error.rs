//! Core error types for wormhole

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use wh_protocol::{ErrorCode, ProtocolError};

/// Top-level error type for the wormhole components
#[derive(Error, Debug)]
pub enum WhError {
    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Dispatch error
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors establishing or using an encrypted connection
#[derive(Error, Debug)]
pub enum TransportError {
    /// TCP connect failed
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// TLS negotiation failed
    #[error("TLS handshake with {peer} failed: {message}")]
    Handshake { peer: String, message: String },

    /// Connect plus handshake did not finish in time
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Server name is not a valid DNS name or IP address
    #[error("Invalid server name: {0}")]
    InvalidServerName(String),

    /// The peer closed the connection
    #[error("Connection closed by peer")]
    Closed,

    /// Protocol violation on an established connection
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl TransportError {
    /// Whether a later attempt might succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::InvalidServerName(_))
    }
}

/// Errors surfaced to callers of the dispatcher
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// Stream bound for the session was reached and no slot freed in time
    #[error("Overloaded: {limit} streams already open")]
    Overload { limit: usize },

    /// The stream was cancelled (shutdown or session loss)
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// No tunnel owner is registered
    #[error("No tunnel owner available")]
    Unavailable,

    /// The stream deadline passed
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// The connector reported an error for this stream
    #[error("Remote error ({code:?}): {message}")]
    Remote { code: ErrorCode, message: String },

    /// Response exceeded the allowed size
    #[error("Response too large: more than {max} bytes")]
    TooLarge { max: usize },
}

impl DispatchError {
    /// Whether the caller may retry the request
    pub fn is_retryable(&self) -> bool {
        matches!(self, DispatchError::Overload { .. } | DispatchError::Unavailable)
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// TLS material is unreadable or malformed
    #[error("TLS material {path}: {message}")]
    Tls { path: PathBuf, message: String },
}

impl ConfigError {
    pub(crate) fn tls(path: &std::path::Path, message: impl Into<String>) -> Self {
        Self::Tls {
            path: path.to_path_buf(),
            message: message.into(),
        }
    }
}
