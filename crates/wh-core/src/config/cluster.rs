//! Cluster membership and election configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::duration_millis;
use crate::types::NodeId;

/// Configuration for gossip membership and leader election
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Host other members use to reach this node
    pub advertise_host: String,

    /// Host the gossip and consensus sockets bind to
    pub bind_host: String,

    /// UDP port for gossip membership
    pub gossip_port: u16,

    /// UDP port for leader election
    pub consensus_port: u16,

    /// Gossip addresses (`host:port`) of the other voting members
    pub peers: Vec<String>,

    /// Interval between gossip probe rounds
    #[serde(with = "duration_millis")]
    pub gossip_interval: Duration,

    /// Number of peers probed per round
    pub gossip_fanout: usize,

    /// Consecutive missed probes before a peer is suspected
    pub suspect_after_probes: u32,

    /// Time a suspect peer has to refute before it is declared dead
    #[serde(with = "duration_millis")]
    pub suspect_timeout: Duration,

    /// Time dead or departed peers are kept before eviction
    #[serde(with = "duration_millis")]
    pub retention: Duration,

    /// Lower bound of the randomized election timeout
    #[serde(with = "duration_millis")]
    pub election_timeout_min: Duration,

    /// Upper bound of the randomized election timeout
    #[serde(with = "duration_millis")]
    pub election_timeout_max: Duration,

    /// Leader heartbeat interval
    #[serde(with = "duration_millis")]
    pub heartbeat_interval: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            advertise_host: "127.0.0.1".to_string(),
            bind_host: "0.0.0.0".to_string(),
            gossip_port: 1111,
            consensus_port: 1112,
            peers: vec![],
            gossip_interval: Duration::from_millis(500),
            gossip_fanout: 3,
            suspect_after_probes: 3,
            suspect_timeout: Duration::from_secs(3),
            retention: Duration::from_secs(30),
            election_timeout_min: Duration::from_millis(1500),
            election_timeout_max: Duration::from_millis(3000),
            heartbeat_interval: Duration::from_millis(300),
        }
    }
}

impl ClusterConfig {
    /// Identity of the local node: its advertised gossip address, which is
    /// how the other members list it in their `peers`
    pub fn node_id(&self) -> NodeId {
        NodeId::new(self.gossip_advertise())
    }

    /// Gossip address other members dial
    pub fn gossip_advertise(&self) -> String {
        format!("{}:{}", self.advertise_host, self.gossip_port)
    }

    /// Consensus address other members dial
    pub fn consensus_advertise(&self) -> String {
        format!("{}:{}", self.advertise_host, self.consensus_port)
    }

    /// Local gossip socket address
    pub fn gossip_bind(&self) -> String {
        format!("{}:{}", self.bind_host, self.gossip_port)
    }

    /// Local consensus socket address
    pub fn consensus_bind(&self) -> String {
        format!("{}:{}", self.bind_host, self.consensus_port)
    }

    /// Peers, minus any entry naming this node
    pub fn remote_peers(&self) -> Vec<NodeId> {
        let me = self.node_id();
        let mut peers: Vec<NodeId> = self
            .peers
            .iter()
            .map(|p| NodeId::new(p.trim()))
            .filter(|p| !p.as_str().is_empty() && *p != me)
            .collect();
        peers.sort();
        peers.dedup();
        peers
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.election_timeout_min >= self.election_timeout_max {
            return Err("cluster.election_timeout_min must be below election_timeout_max".into());
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err("cluster.heartbeat_interval must be below election_timeout_min".into());
        }
        if self.gossip_fanout == 0 {
            return Err("cluster.gossip_fanout must be at least 1".into());
        }
        if self.suspect_after_probes == 0 {
            return Err("cluster.suspect_after_probes must be at least 1".into());
        }
        if self.gossip_port == self.consensus_port && self.gossip_port != 0 {
            return Err("cluster.gossip_port and consensus_port must differ".into());
        }
        Ok(())
    }
}
