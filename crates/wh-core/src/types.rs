//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a cluster member
///
/// By default this is the member's advertised gossip address, which is what
/// the peer list in the configuration names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    /// Create a new node ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the raw ID string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of one tunnel session on the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Immutable view of who may own the tunnel right now.
///
/// Published by the election driver, the only writer of term and leader.
/// Everyone else reads copies of it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LeadershipSnapshot {
    /// Current consensus term
    pub term: u64,
    /// Leader known for `term`, if any
    pub leader: Option<NodeId>,
    /// The local node is leader and its leadership entry is committed
    pub owner: bool,
    /// The local node can currently reach a quorum of voters
    pub quorum: bool,
    /// Highest committed log index
    pub commit_index: u64,
}

impl LeadershipSnapshot {
    /// Whether the local node may register as tunnel owner
    pub fn is_owner(&self) -> bool {
        self.owner && self.quorum
    }

    /// Whether `node` is the recorded leader of `term`
    pub fn is_leader(&self, node: &NodeId, term: u64) -> bool {
        self.term == term && self.leader.as_ref() == Some(node)
    }
}

/// Connection state of the reverse tunnel client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TunnelState {
    /// No session and not trying to establish one
    Disconnected,
    /// Dialing or registering
    Connecting,
    /// Registered and serving streams
    Connected,
    /// Finishing in-flight streams before closing
    Draining,
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelState::Disconnected => write!(f, "disconnected"),
            TunnelState::Connecting => write!(f, "connecting"),
            TunnelState::Connected => write!(f, "connected"),
            TunnelState::Draining => write!(f, "draining"),
        }
    }
}
