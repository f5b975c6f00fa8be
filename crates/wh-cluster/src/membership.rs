//! SWIM-style gossip membership
//!
//! Liveness is tracked per peer with incarnation numbers. A peer that
//! misses `suspect_after_probes` consecutive probes becomes `Suspect`; a
//! suspect that does not refute within `suspect_timeout` becomes `Dead`.
//! `Dead` and `Left` peers are evicted after `retention`. A node refutes a
//! suspicion about itself by bumping its incarnation.
//!
//! Reports from other nodes are never trusted to declare death: a remote
//! "dead" digest only moves an `Alive` peer to `Suspect` locally, so every
//! peer passes through `Suspect` before it is declared `Dead` here.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use wh_core::config::ClusterConfig;
use wh_core::NodeId;

/// Liveness of a peer as seen locally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerStatus {
    Alive,
    Suspect,
    Dead,
    Left,
}

impl PeerStatus {
    /// Dead and Left peers are no longer probed
    pub fn is_terminal(&self) -> bool {
        matches!(self, PeerStatus::Dead | PeerStatus::Left)
    }
}

/// What one node claims about one member, piggybacked on gossip
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDigest {
    pub id: NodeId,
    pub gossip_addr: String,
    pub consensus_addr: String,
    pub incarnation: u64,
    pub status: PeerStatus,
}

/// A remote member as tracked by this node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: NodeId,
    pub gossip_addr: String,
    /// Learned from the peer's own digest
    pub consensus_addr: Option<String>,
    pub incarnation: u64,
    pub status: PeerStatus,
    /// Last time the peer itself was heard from
    pub last_seen: Instant,
    /// When `status` last changed
    pub status_since: Instant,
    /// Member of the configured voter set
    pub voter: bool,
}

/// Membership timing and fan-out
#[derive(Debug, Clone)]
pub struct MembershipConfig {
    pub fanout: usize,
    pub suspect_after_probes: u32,
    pub suspect_timeout: Duration,
    pub retention: Duration,
}

impl From<&ClusterConfig> for MembershipConfig {
    fn from(config: &ClusterConfig) -> Self {
        Self {
            fanout: config.gossip_fanout,
            suspect_after_probes: config.suspect_after_probes,
            suspect_timeout: config.suspect_timeout,
            retention: config.retention,
        }
    }
}

/// Observable membership changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    Joined(NodeId),
    StatusChanged {
        id: NodeId,
        from: PeerStatus,
        to: PeerStatus,
    },
    Evicted(NodeId),
    /// This node bumped its incarnation to refute a suspicion
    Refuted { incarnation: u64 },
}

#[derive(Debug)]
struct Entry {
    peer: Peer,
    awaiting_ack: bool,
    missed_probes: u32,
}

/// Membership state machine. Time is always passed in.
#[derive(Debug)]
pub struct Membership {
    local: PeerDigest,
    config: MembershipConfig,
    peers: BTreeMap<NodeId, Entry>,
    /// Configured voters, probed even after eviction so they can rejoin
    seeds: BTreeSet<NodeId>,
}

impl Membership {
    pub fn new(
        id: NodeId,
        gossip_addr: impl Into<String>,
        consensus_addr: impl Into<String>,
        config: MembershipConfig,
    ) -> Self {
        Self {
            local: PeerDigest {
                id,
                gossip_addr: gossip_addr.into(),
                consensus_addr: consensus_addr.into(),
                incarnation: 0,
                status: PeerStatus::Alive,
            },
            config,
            peers: BTreeMap::new(),
            seeds: BTreeSet::new(),
        }
    }

    /// Register a configured voter. Its id is its gossip address.
    pub fn add_seed(&mut self, id: NodeId, now: Instant) {
        if id == self.local.id {
            return;
        }
        self.seeds.insert(id.clone());
        self.peers.entry(id.clone()).or_insert_with(|| Entry {
            peer: Peer {
                gossip_addr: id.as_str().to_string(),
                id,
                consensus_addr: None,
                incarnation: 0,
                status: PeerStatus::Alive,
                last_seen: now,
                status_since: now,
                voter: true,
            },
            awaiting_ack: false,
            missed_probes: 0,
        });
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local.id
    }

    /// This node's own digest
    pub fn local_digest(&self) -> PeerDigest {
        self.local.clone()
    }

    pub fn incarnation(&self) -> u64 {
        self.local.incarnation
    }

    pub fn get(&self, id: &NodeId) -> Option<&Peer> {
        self.peers.get(id).map(|e| &e.peer)
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values().map(|e| &e.peer)
    }

    /// Copy of every tracked peer, for publishing
    pub fn snapshot(&self) -> Vec<Peer> {
        self.peers().cloned().collect()
    }

    /// Digests of this node and every tracked peer
    pub fn digests(&self) -> Vec<PeerDigest> {
        let mut out = Vec::with_capacity(self.peers.len() + 1);
        out.push(self.local.clone());
        out.extend(self.peers.values().map(|e| PeerDigest {
            id: e.peer.id.clone(),
            gossip_addr: e.peer.gossip_addr.clone(),
            consensus_addr: e.peer.consensus_addr.clone().unwrap_or_default(),
            incarnation: e.peer.incarnation,
            status: e.peer.status,
        }));
        out
    }

    /// Gossip addresses of everyone a leave should reach
    pub fn broadcast_targets(&self) -> Vec<String> {
        self.peers
            .values()
            .filter(|e| !e.peer.status.is_terminal())
            .map(|e| e.peer.gossip_addr.clone())
            .collect()
    }

    /// Advance timers: account missed probes, expire suspects, evict.
    pub fn tick(&mut self, now: Instant) -> Vec<MembershipEvent> {
        let mut events = Vec::new();
        let mut evict = Vec::new();

        for entry in self.peers.values_mut() {
            if entry.awaiting_ack {
                entry.awaiting_ack = false;
                entry.missed_probes = entry.missed_probes.saturating_add(1);
                if entry.peer.status == PeerStatus::Alive
                    && entry.missed_probes >= self.config.suspect_after_probes
                {
                    set_status(&mut entry.peer, PeerStatus::Suspect, now, &mut events);
                }
            }

            let elapsed = now.saturating_duration_since(entry.peer.status_since);
            match entry.peer.status {
                PeerStatus::Suspect if elapsed >= self.config.suspect_timeout => {
                    set_status(&mut entry.peer, PeerStatus::Dead, now, &mut events);
                }
                PeerStatus::Dead | PeerStatus::Left if elapsed >= self.config.retention => {
                    evict.push(entry.peer.id.clone());
                }
                _ => {}
            }
        }

        for id in evict {
            self.peers.remove(&id);
            events.push(MembershipEvent::Evicted(id));
        }
        events
    }

    /// Pick up to `fanout` peers to probe this round and mark them as
    /// awaiting an ack. Evicted seeds are included so they can rejoin.
    pub fn probe_targets<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Vec<String> {
        let mut candidates: Vec<String> = self
            .peers
            .values()
            .filter(|e| !e.peer.status.is_terminal())
            .map(|e| e.peer.gossip_addr.clone())
            .collect();
        candidates.extend(
            self.seeds
                .iter()
                .filter(|id| !self.peers.contains_key(*id))
                .map(|id| id.as_str().to_string()),
        );

        candidates.shuffle(rng);
        candidates.truncate(self.config.fanout);

        for entry in self.peers.values_mut() {
            if candidates.contains(&entry.peer.gossip_addr) {
                entry.awaiting_ack = true;
            }
        }
        candidates
    }

    /// A ping or ack arrived from `sender` carrying `digests`.
    ///
    /// `is_ack` clears the pending probe for the sender.
    pub fn receive(
        &mut self,
        sender: &PeerDigest,
        digests: &[PeerDigest],
        is_ack: bool,
        now: Instant,
    ) -> Vec<MembershipEvent> {
        let mut events = Vec::new();

        self.merge(sender, now, &mut events);
        if let Some(entry) = self.peers.get_mut(&sender.id) {
            entry.peer.last_seen = now;
            if is_ack {
                entry.awaiting_ack = false;
                entry.missed_probes = 0;
            }
        }

        for digest in digests {
            if digest.id != sender.id {
                self.merge(digest, now, &mut events);
            }
        }
        events
    }

    /// A peer announced it is leaving
    pub fn receive_leave(&mut self, sender: &PeerDigest, now: Instant) -> Vec<MembershipEvent> {
        let mut events = Vec::new();
        let leave = PeerDigest {
            status: PeerStatus::Left,
            ..sender.clone()
        };
        self.merge(&leave, now, &mut events);
        events
    }

    /// Mark this node as leaving and return the digest to broadcast
    pub fn leave(&mut self) -> PeerDigest {
        self.local.incarnation += 1;
        self.local.status = PeerStatus::Left;
        self.local.clone()
    }

    fn merge(&mut self, digest: &PeerDigest, now: Instant, events: &mut Vec<MembershipEvent>) {
        if digest.id == self.local.id {
            self.refute(digest, events);
            return;
        }

        let Some(entry) = self.peers.get_mut(&digest.id) else {
            if !digest.status.is_terminal() {
                self.peers.insert(
                    digest.id.clone(),
                    Entry {
                        peer: Peer {
                            id: digest.id.clone(),
                            gossip_addr: digest.gossip_addr.clone(),
                            consensus_addr: non_empty(&digest.consensus_addr),
                            incarnation: digest.incarnation,
                            status: digest.status,
                            last_seen: now,
                            status_since: now,
                            voter: self.seeds.contains(&digest.id),
                        },
                        awaiting_ack: false,
                        missed_probes: 0,
                    },
                );
                events.push(MembershipEvent::Joined(digest.id.clone()));
            }
            return;
        };

        let peer = &mut entry.peer;
        if peer.consensus_addr.is_none() {
            peer.consensus_addr = non_empty(&digest.consensus_addr);
        }

        match digest.status {
            PeerStatus::Alive => {
                if digest.incarnation > peer.incarnation {
                    peer.incarnation = digest.incarnation;
                    if let Some(addr) = non_empty(&digest.consensus_addr) {
                        peer.consensus_addr = Some(addr);
                    }
                    if peer.status != PeerStatus::Alive {
                        set_status(peer, PeerStatus::Alive, now, events);
                    }
                    entry.missed_probes = 0;
                }
            }
            PeerStatus::Suspect | PeerStatus::Dead => {
                let newer = digest.incarnation > peer.incarnation;
                if newer || digest.incarnation == peer.incarnation {
                    if newer {
                        peer.incarnation = digest.incarnation;
                    }
                    if peer.status == PeerStatus::Alive {
                        set_status(peer, PeerStatus::Suspect, now, events);
                    }
                }
            }
            PeerStatus::Left => {
                if digest.incarnation >= peer.incarnation && peer.status != PeerStatus::Left {
                    peer.incarnation = digest.incarnation;
                    set_status(peer, PeerStatus::Left, now, events);
                }
            }
        }
    }

    fn refute(&mut self, digest: &PeerDigest, events: &mut Vec<MembershipEvent>) {
        if self.local.status == PeerStatus::Left {
            return;
        }
        let accused = matches!(digest.status, PeerStatus::Suspect | PeerStatus::Dead);
        if accused && digest.incarnation >= self.local.incarnation {
            self.local.incarnation = digest.incarnation + 1;
            events.push(MembershipEvent::Refuted {
                incarnation: self.local.incarnation,
            });
        }
    }
}

fn set_status(peer: &mut Peer, to: PeerStatus, now: Instant, events: &mut Vec<MembershipEvent>) {
    let from = peer.status;
    peer.status = to;
    peer.status_since = now;
    events.push(MembershipEvent::StatusChanged {
        id: peer.id.clone(),
        from,
        to,
    });
}

fn non_empty(addr: &str) -> Option<String> {
    if addr.is_empty() {
        None
    } else {
        Some(addr.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn config() -> MembershipConfig {
        MembershipConfig {
            fanout: 3,
            suspect_after_probes: 3,
            suspect_timeout: Duration::from_secs(3),
            retention: Duration::from_secs(30),
        }
    }

    fn membership(now: Instant) -> Membership {
        let mut m = Membership::new(
            NodeId::new("10.0.0.1:1111"),
            "10.0.0.1:1111",
            "10.0.0.1:1112",
            config(),
        );
        m.add_seed(NodeId::new("10.0.0.2:1111"), now);
        m
    }

    fn digest(id: &str, incarnation: u64, status: PeerStatus) -> PeerDigest {
        PeerDigest {
            id: NodeId::new(id),
            gossip_addr: id.to_string(),
            consensus_addr: String::new(),
            incarnation,
            status,
        }
    }

    fn status(m: &Membership, id: &str) -> Option<PeerStatus> {
        m.get(&NodeId::new(id)).map(|p| p.status)
    }

    fn miss_rounds(m: &mut Membership, rng: &mut StdRng, now: Instant, rounds: u32) {
        for _ in 0..rounds {
            m.probe_targets(rng);
            m.tick(now);
        }
    }

    #[test]
    fn test_missed_probes_suspect_then_dead_then_evicted() {
        let start = Instant::now();
        let mut rng = StdRng::seed_from_u64(1);
        let mut m = membership(start);
        let peer = "10.0.0.2:1111";

        miss_rounds(&mut m, &mut rng, start, 2);
        assert_eq!(status(&m, peer), Some(PeerStatus::Alive));

        miss_rounds(&mut m, &mut rng, start, 1);
        assert_eq!(status(&m, peer), Some(PeerStatus::Suspect));

        m.tick(start + Duration::from_secs(2));
        assert_eq!(status(&m, peer), Some(PeerStatus::Suspect));

        let events = m.tick(start + Duration::from_secs(3));
        assert!(events.contains(&MembershipEvent::StatusChanged {
            id: NodeId::new(peer),
            from: PeerStatus::Suspect,
            to: PeerStatus::Dead,
        }));

        let events = m.tick(start + Duration::from_secs(33));
        assert_eq!(events, vec![MembershipEvent::Evicted(NodeId::new(peer))]);
        assert_eq!(status(&m, peer), None);

        // Evicted seeds are still probed
        assert_eq!(m.probe_targets(&mut rng), vec![peer.to_string()]);
    }

    #[test]
    fn test_ack_resets_missed_probes() {
        let now = Instant::now();
        let mut rng = StdRng::seed_from_u64(2);
        let mut m = membership(now);

        miss_rounds(&mut m, &mut rng, now, 2);
        m.probe_targets(&mut rng);
        m.receive(&digest("10.0.0.2:1111", 0, PeerStatus::Alive), &[], true, now);
        m.tick(now);
        miss_rounds(&mut m, &mut rng, now, 2);

        assert_eq!(status(&m, "10.0.0.2:1111"), Some(PeerStatus::Alive));
    }

    #[test]
    fn test_remote_dead_report_only_suspects() {
        let now = Instant::now();
        let mut m = membership(now);

        m.receive(
            &digest("10.0.0.3:1111", 0, PeerStatus::Alive),
            &[digest("10.0.0.2:1111", 0, PeerStatus::Dead)],
            false,
            now,
        );
        assert_eq!(status(&m, "10.0.0.2:1111"), Some(PeerStatus::Suspect));
        assert_eq!(status(&m, "10.0.0.3:1111"), Some(PeerStatus::Alive));
    }

    #[test]
    fn test_refutation_with_higher_incarnation() {
        let now = Instant::now();
        let mut m = membership(now);
        let peer = "10.0.0.2:1111";

        m.receive(
            &digest("10.0.0.3:1111", 0, PeerStatus::Alive),
            &[digest(peer, 0, PeerStatus::Suspect)],
            false,
            now,
        );
        assert_eq!(status(&m, peer), Some(PeerStatus::Suspect));

        // Same incarnation does not clear suspicion
        m.receive(&digest(peer, 0, PeerStatus::Alive), &[], true, now);
        assert_eq!(status(&m, peer), Some(PeerStatus::Suspect));

        m.receive(&digest(peer, 1, PeerStatus::Alive), &[], true, now);
        assert_eq!(status(&m, peer), Some(PeerStatus::Alive));
    }

    #[test]
    fn test_local_node_refutes_suspicion() {
        let now = Instant::now();
        let mut m = membership(now);

        let events = m.receive(
            &digest("10.0.0.2:1111", 0, PeerStatus::Alive),
            &[digest("10.0.0.1:1111", 0, PeerStatus::Suspect)],
            false,
            now,
        );
        assert_eq!(events, vec![MembershipEvent::Refuted { incarnation: 1 }]);
        assert_eq!(m.local_digest().incarnation, 1);
        assert_eq!(m.local_digest().status, PeerStatus::Alive);
    }

    #[test]
    fn test_leave_is_authoritative() {
        let now = Instant::now();
        let mut m = membership(now);

        m.receive_leave(&digest("10.0.0.2:1111", 1, PeerStatus::Alive), now);
        assert_eq!(status(&m, "10.0.0.2:1111"), Some(PeerStatus::Left));
        assert!(m.broadcast_targets().is_empty());

        let mine = m.leave();
        assert_eq!(mine.status, PeerStatus::Left);
        assert_eq!(mine.incarnation, 1);
    }

    #[test]
    fn test_consensus_address_learned_from_gossip() {
        let now = Instant::now();
        let mut m = membership(now);

        let mut sender = digest("10.0.0.2:1111", 0, PeerStatus::Alive);
        sender.consensus_addr = "10.0.0.2:2112".into();
        m.receive(&sender, &[], true, now);

        let peer = m.get(&NodeId::new("10.0.0.2:1111")).unwrap();
        assert_eq!(peer.consensus_addr.as_deref(), Some("10.0.0.2:2112"));
        assert!(peer.voter);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Probe,
        Ack,
        Advance(u64),
        Report(u64, PeerStatus),
    }

    fn op() -> impl Strategy<Value = Op> {
        let status = prop_oneof![
            Just(PeerStatus::Alive),
            Just(PeerStatus::Suspect),
            Just(PeerStatus::Dead),
            Just(PeerStatus::Left),
        ];
        prop_oneof![
            Just(Op::Probe),
            Just(Op::Ack),
            (0u64..5_000).prop_map(Op::Advance),
            (0u64..4, status).prop_map(|(i, s)| Op::Report(i, s)),
        ]
    }

    proptest! {
        #[test]
        fn prop_dead_only_via_suspect(ops in proptest::collection::vec(op(), 1..200)) {
            let start = Instant::now();
            let mut now = start;
            let mut rng = StdRng::seed_from_u64(7);
            let mut m = membership(start);
            let peer = NodeId::new("10.0.0.2:1111");
            let other = digest("10.0.0.3:1111", 0, PeerStatus::Alive);

            for op in ops {
                let before = m.get(&peer).map(|p| p.status);
                let events = match op {
                    Op::Probe => {
                        m.probe_targets(&mut rng);
                        m.tick(now)
                    }
                    Op::Ack => {
                        let inc = m.get(&peer).map(|p| p.incarnation).unwrap_or(0);
                        m.receive(&digest(peer.as_str(), inc, PeerStatus::Alive), &[], true, now)
                    }
                    Op::Advance(ms) => {
                        now += Duration::from_millis(ms);
                        m.tick(now)
                    }
                    Op::Report(inc, status) => {
                        m.receive(&other, &[digest(peer.as_str(), inc, status)], false, now)
                    }
                };

                for event in &events {
                    if let MembershipEvent::StatusChanged { to: PeerStatus::Dead, from, .. } = event {
                        prop_assert_eq!(*from, PeerStatus::Suspect);
                    }
                }
                let after = m.get(&peer).map(|p| p.status);
                if after == Some(PeerStatus::Dead) && before != Some(PeerStatus::Dead) {
                    prop_assert_eq!(before, Some(PeerStatus::Suspect));
                }
            }
        }
    }
}
