//! Datagram formats for gossip and election traffic
//!
//! Each UDP datagram carries exactly one bincode-encoded message.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use wh_core::NodeId;

use crate::election::ConsensusMessage;
use crate::error::ClusterError;
use crate::membership::PeerDigest;

/// Largest datagram either socket will send or accept
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Gossip traffic on the membership port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GossipMessage {
    Ping {
        from: PeerDigest,
        digests: Vec<PeerDigest>,
    },
    Ack {
        from: PeerDigest,
        digests: Vec<PeerDigest>,
    },
    Leave {
        from: PeerDigest,
    },
}

impl GossipMessage {
    pub fn sender(&self) -> &PeerDigest {
        match self {
            GossipMessage::Ping { from, .. }
            | GossipMessage::Ack { from, .. }
            | GossipMessage::Leave { from } => from,
        }
    }
}

/// Election traffic on the consensus port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusEnvelope {
    pub from: NodeId,
    pub message: ConsensusMessage,
}

pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, ClusterError> {
    Ok(bincode::serialize(message)?)
}

pub fn decode<T: DeserializeOwned>(buf: &[u8], peer: &str) -> Result<T, ClusterError> {
    bincode::deserialize(buf).map_err(|source| ClusterError::Malformed {
        peer: peer.to_string(),
        source,
    })
}
