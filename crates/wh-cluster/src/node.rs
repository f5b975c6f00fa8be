//! Async drivers for membership and election
//!
//! [`ClusterNode`] owns two tasks. The membership task is the only writer
//! of peer liveness, the election task the only writer of term and leader.
//! Each publishes immutable snapshots on a `watch` channel; everything
//! else only reads them.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use wh_core::config::ClusterConfig;
use wh_core::{LeadershipSnapshot, NodeId};

use crate::election::{Election, ElectionEvent, ElectionTiming, Step};
use crate::error::ClusterError;
use crate::membership::{Membership, MembershipConfig, MembershipEvent, Peer};
use crate::store::StateStore;
use crate::wire::{self, ConsensusEnvelope, GossipMessage, MAX_DATAGRAM_SIZE};

/// How long `leave()` waits for the broadcast to go out
const LEAVE_TIMEOUT: Duration = Duration::from_secs(1);

enum Command {
    Leave(oneshot::Sender<()>),
}

/// A running cluster member
pub struct ClusterNode {
    id: NodeId,
    gossip_addr: SocketAddr,
    consensus_addr: SocketAddr,
    leadership: watch::Receiver<LeadershipSnapshot>,
    members: watch::Receiver<Vec<Peer>>,
    commands: mpsc::Sender<Command>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<Result<(), ClusterError>>>,
}

impl ClusterNode {
    /// Bind both sockets, load persisted state and start the drivers.
    ///
    /// Unreadable state is returned as an error; the node does not start.
    pub async fn start(
        config: &ClusterConfig,
        store: Box<dyn StateStore>,
        cancel: CancellationToken,
    ) -> Result<Self, ClusterError> {
        let id = config.node_id();
        let state = store.load()?.unwrap_or_default();

        let gossip_socket = bind(&config.gossip_bind()).await?;
        let consensus_socket = bind(&config.consensus_bind()).await?;
        let gossip_addr = local_addr(&gossip_socket, &config.gossip_bind())?;
        let consensus_addr = local_addr(&consensus_socket, &config.consensus_bind())?;

        let now = Instant::now();
        let mut rng = StdRng::from_entropy();

        let peers = config.remote_peers();
        let mut membership = Membership::new(
            id.clone(),
            config.gossip_advertise(),
            config.consensus_advertise(),
            MembershipConfig::from(config),
        );
        for peer in &peers {
            membership.add_seed(peer.clone(), now);
        }

        let mut voters = peers;
        voters.push(id.clone());
        let voter_count = voters.len();
        let election = Election::new(
            id.clone(),
            voters,
            state,
            ElectionTiming::from(config),
            now,
            &mut rng,
        )?;

        tracing::info!(
            node = %id,
            gossip = %gossip_addr,
            consensus = %consensus_addr,
            term = election.term(),
            voters = voter_count,
            "Cluster node starting"
        );

        let cancel = cancel.child_token();
        let (leadership_tx, leadership) = watch::channel(election.snapshot());
        let (members_tx, members) = watch::channel(membership.snapshot());
        let (commands, command_rx) = mpsc::channel(4);

        let membership_task = tokio::spawn(run_membership(
            membership,
            gossip_socket,
            config.gossip_interval,
            members_tx,
            command_rx,
            cancel.clone(),
        ));

        let election_task = tokio::spawn(run_election(ElectionDriver {
            election,
            store,
            socket: consensus_socket,
            members: members.clone(),
            consensus_port: config.consensus_port,
            leadership_tx,
            rng,
            tick: (config.heartbeat_interval / 2).max(Duration::from_millis(10)),
            cancel: cancel.clone(),
        }));

        Ok(Self {
            id,
            gossip_addr,
            consensus_addr,
            leadership,
            members,
            commands,
            cancel,
            tasks: vec![membership_task, election_task],
        })
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Bound gossip socket address
    pub fn gossip_addr(&self) -> SocketAddr {
        self.gossip_addr
    }

    /// Bound consensus socket address
    pub fn consensus_addr(&self) -> SocketAddr {
        self.consensus_addr
    }

    /// Subscribe to leadership snapshots
    pub fn leadership(&self) -> watch::Receiver<LeadershipSnapshot> {
        self.leadership.clone()
    }

    /// Subscribe to membership snapshots
    pub fn members(&self) -> watch::Receiver<Vec<Peer>> {
        self.members.clone()
    }

    /// Cancelled when the node stops, including after a fatal error
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Broadcast that this node is leaving the cluster
    pub async fn leave(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Leave(tx)).await.is_err() {
            return;
        }
        if tokio::time::timeout(LEAVE_TIMEOUT, rx).await.is_err() {
            tracing::warn!("Leave broadcast did not complete in time");
        }
    }

    /// Stop both drivers and release the sockets
    pub async fn shutdown(self) -> Result<(), ClusterError> {
        self.cancel.cancel();

        let mut result = Ok(());
        for task in self.tasks {
            match task.await {
                Ok(Err(e)) if result.is_ok() => result = Err(e),
                Ok(_) => {}
                Err(e) => tracing::error!("Cluster task panicked: {}", e),
            }
        }
        tracing::info!(node = %self.id, "Cluster node stopped");
        result
    }
}

async fn bind(addr: &str) -> Result<UdpSocket, ClusterError> {
    UdpSocket::bind(addr)
        .await
        .map_err(|source| ClusterError::Bind {
            addr: addr.to_string(),
            source,
        })
}

fn local_addr(socket: &UdpSocket, addr: &str) -> Result<SocketAddr, ClusterError> {
    socket.local_addr().map_err(|source| ClusterError::Bind {
        addr: addr.to_string(),
        source,
    })
}

async fn run_membership(
    mut membership: Membership,
    socket: UdpSocket,
    interval: Duration,
    members_tx: watch::Sender<Vec<Peer>>,
    mut commands: mpsc::Receiver<Command>,
    cancel: CancellationToken,
) -> Result<(), ClusterError> {
    let socket = Arc::new(socket);
    let mut rng = StdRng::from_entropy();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            _ = ticker.tick() => {
                let events = membership.tick(Instant::now());
                log_membership(&events);

                let ping = GossipMessage::Ping {
                    from: membership.local_digest(),
                    digests: membership.digests(),
                };
                let bytes = wire::encode(&ping)?;
                for target in membership.probe_targets(&mut rng) {
                    if let Err(e) = socket.send_to(&bytes, target.as_str()).await {
                        tracing::debug!(%target, "Gossip probe failed: {}", e);
                    }
                }
                members_tx.send_replace(membership.snapshot());
            }

            result = socket.recv_from(&mut buf) => {
                let (len, src) = match result {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::debug!("Gossip receive failed: {}", e);
                        continue;
                    }
                };
                let message: GossipMessage = match wire::decode(&buf[..len], &src.to_string()) {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::warn!("{}", e);
                        continue;
                    }
                };

                let now = Instant::now();
                let events = match message {
                    GossipMessage::Ping { from, digests } => {
                        let events = membership.receive(&from, &digests, false, now);
                        let ack = GossipMessage::Ack {
                            from: membership.local_digest(),
                            digests: membership.digests(),
                        };
                        if let Err(e) = socket.send_to(&wire::encode(&ack)?, src).await {
                            tracing::debug!(%src, "Gossip ack failed: {}", e);
                        }
                        events
                    }
                    GossipMessage::Ack { from, digests } => {
                        membership.receive(&from, &digests, true, now)
                    }
                    GossipMessage::Leave { from } => membership.receive_leave(&from, now),
                };
                log_membership(&events);
                members_tx.send_replace(membership.snapshot());
            }

            Some(command) = commands.recv() => match command {
                Command::Leave(done) => {
                    let targets = membership.broadcast_targets();
                    let leave = GossipMessage::Leave { from: membership.leave() };
                    let bytes = wire::encode(&leave)?;
                    for target in &targets {
                        if let Err(e) = socket.send_to(&bytes, target.as_str()).await {
                            tracing::debug!(%target, "Leave broadcast failed: {}", e);
                        }
                    }
                    tracing::info!(peers = targets.len(), "Left the cluster");
                    let _ = done.send(());
                }
            },
        }
    }

    Ok(())
}

fn log_membership(events: &[MembershipEvent]) {
    for event in events {
        match event {
            MembershipEvent::Joined(id) => tracing::info!(peer = %id, "Peer joined"),
            MembershipEvent::StatusChanged { id, from, to } => {
                tracing::info!(peer = %id, ?from, ?to, "Peer status changed")
            }
            MembershipEvent::Evicted(id) => tracing::debug!(peer = %id, "Peer evicted"),
            MembershipEvent::Refuted { incarnation } => {
                tracing::info!(incarnation, "Refuted suspicion")
            }
        }
    }
}

struct ElectionDriver {
    election: Election,
    store: Box<dyn StateStore>,
    socket: UdpSocket,
    members: watch::Receiver<Vec<Peer>>,
    consensus_port: u16,
    leadership_tx: watch::Sender<LeadershipSnapshot>,
    rng: StdRng,
    tick: Duration,
    cancel: CancellationToken,
}

async fn run_election(mut driver: ElectionDriver) -> Result<(), ClusterError> {
    let mut ticker = tokio::time::interval(driver.tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    let result = loop {
        let step = tokio::select! {
            _ = driver.cancel.cancelled() => break Ok(()),

            _ = ticker.tick() => driver.election.tick(Instant::now(), &mut driver.rng),

            result = driver.socket.recv_from(&mut buf) => {
                let (len, src) = match result {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::debug!("Consensus receive failed: {}", e);
                        continue;
                    }
                };
                match wire::decode::<ConsensusEnvelope>(&buf[..len], &src.to_string()) {
                    Ok(envelope) => driver.election.handle(
                        &envelope.from,
                        envelope.message,
                        Instant::now(),
                        &mut driver.rng,
                    ),
                    Err(e) => {
                        tracing::warn!("{}", e);
                        continue;
                    }
                }
            }
        };

        if let Err(e) = driver.apply(step).await {
            tracing::error!("Election driver stopped: {}", e);
            driver.cancel.cancel();
            break Err(e);
        }
    };

    // Nobody owns the tunnel through a stopped node
    driver.leadership_tx.send_modify(|snapshot| {
        snapshot.owner = false;
        snapshot.quorum = false;
    });
    result
}

impl ElectionDriver {
    async fn apply(&mut self, step: Step) -> Result<(), ClusterError> {
        if let Some(state) = &step.persist {
            self.store.save(state)?;
        }

        for (to, message) in step.messages {
            let addr = self.consensus_addr_of(&to);
            let envelope = ConsensusEnvelope {
                from: self.election.id().clone(),
                message,
            };
            if let Err(e) = self.socket.send_to(&wire::encode(&envelope)?, addr.as_str()).await {
                tracing::debug!(peer = %to, %addr, "Consensus send failed: {}", e);
            }
        }

        for event in &step.events {
            match event {
                ElectionEvent::ElectionStarted { term } => {
                    tracing::debug!(term, "Election started")
                }
                ElectionEvent::BecameLeader { term } => tracing::info!(term, "Elected leader"),
                ElectionEvent::BecameOwner { term, index } => {
                    tracing::info!(term, index, "Leadership committed, now tunnel owner")
                }
                ElectionEvent::SteppedDown { term } => tracing::info!(term, "Stepped down"),
                ElectionEvent::QuorumLost { .. } => {}
                ElectionEvent::LeaderChanged { term, leader } => {
                    tracing::info!(term, %leader, "Leader changed")
                }
            }
        }

        let snapshot = self.election.snapshot();
        self.leadership_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
        Ok(())
    }

    /// Gossip-learned consensus address, else the peer's host with our port
    fn consensus_addr_of(&self, peer: &NodeId) -> String {
        let learned = self
            .members
            .borrow()
            .iter()
            .find(|p| &p.id == peer)
            .and_then(|p| p.consensus_addr.clone());

        learned.unwrap_or_else(|| fallback_consensus_addr(peer, self.consensus_port))
    }
}

fn fallback_consensus_addr(peer: &NodeId, port: u16) -> String {
    let host = peer
        .as_str()
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(peer.as_str());
    format!("{}:{}", host, port)
}
