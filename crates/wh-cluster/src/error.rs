//! Cluster error types

use std::path::PathBuf;

use thiserror::Error;
use wh_core::NodeId;

/// Errors raised by the membership and election layers
#[derive(Error, Debug)]
pub enum ClusterError {
    /// A gossip or consensus socket could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Persisted consensus state is unreadable or could not be written
    #[error("Consensus state {path}: {message}")]
    State { path: PathBuf, message: String },

    /// The leader could not reach a majority of voters
    #[error("Quorum lost in term {term}: {reachable} of {voters} voters reachable")]
    QuorumLost {
        term: u64,
        reachable: usize,
        voters: usize,
    },

    /// A datagram from the named peer could not be decoded
    #[error("Malformed message from {peer}: {source}")]
    Malformed {
        peer: String,
        #[source]
        source: bincode::Error,
    },

    /// Encoding an outbound message failed
    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    /// The voter set does not contain this node
    #[error("Node {0} is not a voter")]
    NotVoter(NodeId),
}

impl ClusterError {
    /// Whether the node cannot continue after this error
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClusterError::State { .. } | ClusterError::Bind { .. } | ClusterError::NotVoter(_)
        )
    }

    pub(crate) fn state(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::State {
            path: path.into(),
            message: message.into(),
        }
    }
}
