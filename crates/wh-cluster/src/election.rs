//! Quorum leader election
//!
//! Raft-style election restricted to what tunnel ownership needs: terms,
//! one vote per term, randomized election timeouts, and a replicated log
//! whose only entries are leadership changes `(index, term, leader)`.
//!
//! A newly elected leader appends its own entry and is the tunnel *owner*
//! only once that entry is committed on a majority. A leader that has not
//! heard from a majority within the minimum election timeout steps down.
//!
//! Every transition returns a [`Step`]. Callers must persist
//! [`Step::persist`] before sending any of [`Step::messages`].

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use wh_core::config::ClusterConfig;
use wh_core::{LeadershipSnapshot, NodeId};

use crate::error::ClusterError;
use crate::store::PersistentState;

/// One leadership change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub leader: NodeId,
}

/// Election protocol messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusMessage {
    RequestVote {
        term: u64,
        last_log_index: u64,
        last_log_term: u64,
    },
    Vote {
        term: u64,
        granted: bool,
    },
    AppendEntries {
        term: u64,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    },
    AppendResponse {
        term: u64,
        success: bool,
        match_index: u64,
    },
}

impl ConsensusMessage {
    pub fn term(&self) -> u64 {
        match self {
            ConsensusMessage::RequestVote { term, .. }
            | ConsensusMessage::Vote { term, .. }
            | ConsensusMessage::AppendEntries { term, .. }
            | ConsensusMessage::AppendResponse { term, .. } => *term,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Notable transitions, for logging and tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionEvent {
    ElectionStarted { term: u64 },
    BecameLeader { term: u64 },
    /// The leader's own entry committed: it may own the tunnel
    BecameOwner { term: u64, index: u64 },
    SteppedDown { term: u64 },
    QuorumLost { term: u64, reachable: usize },
    LeaderChanged { term: u64, leader: NodeId },
}

/// Output of one transition
#[derive(Debug, Default)]
pub struct Step {
    /// State to make durable before sending anything
    pub persist: Option<PersistentState>,
    pub messages: Vec<(NodeId, ConsensusMessage)>,
    pub events: Vec<ElectionEvent>,
}

impl Step {
    fn send(&mut self, to: NodeId, message: ConsensusMessage) {
        self.messages.push((to, message));
    }
}

/// Election timing
#[derive(Debug, Clone, Copy)]
pub struct ElectionTiming {
    pub timeout_min: Duration,
    pub timeout_max: Duration,
    pub heartbeat: Duration,
}

impl From<&ClusterConfig> for ElectionTiming {
    fn from(config: &ClusterConfig) -> Self {
        Self {
            timeout_min: config.election_timeout_min,
            timeout_max: config.election_timeout_max,
            heartbeat: config.heartbeat_interval,
        }
    }
}

#[derive(Debug, Default)]
struct Progress {
    next_index: u64,
    match_index: u64,
    last_ack: Option<Instant>,
}

/// Election state machine for one voter
#[derive(Debug)]
pub struct Election {
    id: NodeId,
    voters: BTreeSet<NodeId>,
    timing: ElectionTiming,
    state: PersistentState,
    dirty: bool,

    role: Role,
    leader: Option<NodeId>,
    commit_index: u64,
    election_deadline: Instant,

    votes: BTreeSet<NodeId>,
    progress: BTreeMap<NodeId, Progress>,
    leader_since: Instant,
    last_broadcast: Option<Instant>,
    own_entry: Option<u64>,
    quorum: bool,
}

impl Election {
    /// Create a follower from persisted state.
    ///
    /// `voters` must contain `id`.
    pub fn new<R: Rng + ?Sized>(
        id: NodeId,
        voters: impl IntoIterator<Item = NodeId>,
        state: PersistentState,
        timing: ElectionTiming,
        now: Instant,
        rng: &mut R,
    ) -> Result<Self, ClusterError> {
        let voters: BTreeSet<NodeId> = voters.into_iter().collect();
        if !voters.contains(&id) {
            return Err(ClusterError::NotVoter(id));
        }

        let mut election = Self {
            id,
            voters,
            timing,
            state,
            dirty: false,
            role: Role::Follower,
            leader: None,
            commit_index: 0,
            election_deadline: now,
            votes: BTreeSet::new(),
            progress: BTreeMap::new(),
            leader_since: now,
            last_broadcast: None,
            own_entry: None,
            quorum: false,
        };
        election.reset_election_deadline(now, rng);
        Ok(election)
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn term(&self) -> u64 {
        self.state.current_term
    }

    pub fn leader(&self) -> Option<&NodeId> {
        self.leader.as_ref()
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn state(&self) -> &PersistentState {
        &self.state
    }

    /// Committed prefix of the leadership log
    pub fn committed(&self) -> &[LogEntry] {
        let end = (self.commit_index as usize).min(self.state.log.len());
        &self.state.log[..end]
    }

    pub fn quorum_size(&self) -> usize {
        self.voters.len() / 2 + 1
    }

    /// Leader whose own leadership entry is committed and which still
    /// reaches a quorum
    pub fn is_owner(&self) -> bool {
        self.role == Role::Leader
            && self.quorum
            && self.own_entry.is_some_and(|index| self.commit_index >= index)
    }

    pub fn snapshot(&self) -> LeadershipSnapshot {
        LeadershipSnapshot {
            term: self.state.current_term,
            leader: self.leader.clone(),
            owner: self.is_owner(),
            quorum: self.quorum,
            commit_index: self.commit_index,
        }
    }

    /// Advance timers
    pub fn tick<R: Rng + ?Sized>(&mut self, now: Instant, rng: &mut R) -> Step {
        let mut step = Step::default();

        match self.role {
            Role::Leader => {
                if !self.check_quorum(now, &mut step) {
                    self.reset_election_deadline(now, rng);
                } else if self
                    .last_broadcast
                    .map_or(true, |at| now.saturating_duration_since(at) >= self.timing.heartbeat)
                {
                    self.broadcast_append(now, &mut step);
                }
            }
            Role::Follower | Role::Candidate => {
                if now >= self.election_deadline {
                    self.start_election(now, rng, &mut step);
                }
            }
        }

        self.finish(step)
    }

    /// Handle one message from `from`
    pub fn handle<R: Rng + ?Sized>(
        &mut self,
        from: &NodeId,
        message: ConsensusMessage,
        now: Instant,
        rng: &mut R,
    ) -> Step {
        let mut step = Step::default();

        if !self.voters.contains(from) || *from == self.id {
            tracing::debug!(%from, "Ignoring consensus message from non-voter");
            return step;
        }

        if message.term() > self.state.current_term {
            self.become_follower(message.term(), now, rng, &mut step);
        }

        match message {
            ConsensusMessage::RequestVote {
                term,
                last_log_index,
                last_log_term,
            } => self.on_request_vote(from, term, last_log_index, last_log_term, now, rng, &mut step),
            ConsensusMessage::Vote { term, granted } => {
                self.on_vote(from, term, granted, now, &mut step)
            }
            ConsensusMessage::AppendEntries {
                term,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => self.on_append(
                from,
                term,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
                now,
                rng,
                &mut step,
            ),
            ConsensusMessage::AppendResponse {
                term,
                success,
                match_index,
            } => self.on_append_response(from, term, success, match_index, now, &mut step),
        }

        self.finish(step)
    }

    fn finish(&mut self, mut step: Step) -> Step {
        if self.dirty {
            self.dirty = false;
            step.persist = Some(self.state.clone());
        }
        step
    }

    fn reset_election_deadline<R: Rng + ?Sized>(&mut self, now: Instant, rng: &mut R) {
        let min = self.timing.timeout_min.as_millis() as u64;
        let max = (self.timing.timeout_max.as_millis() as u64).max(min + 1);
        self.election_deadline = now + Duration::from_millis(rng.gen_range(min..max));
    }

    fn others(&self) -> impl Iterator<Item = &NodeId> {
        self.voters.iter().filter(move |v| **v != self.id)
    }

    fn start_election<R: Rng + ?Sized>(&mut self, now: Instant, rng: &mut R, step: &mut Step) {
        self.state.current_term += 1;
        self.state.voted_for = Some(self.id.clone());
        self.dirty = true;
        self.role = Role::Candidate;
        self.leader = None;
        self.quorum = false;
        self.votes.clear();
        self.votes.insert(self.id.clone());
        self.reset_election_deadline(now, rng);

        let term = self.state.current_term;
        step.events.push(ElectionEvent::ElectionStarted { term });

        if self.votes.len() >= self.quorum_size() {
            self.become_leader(now, step);
            return;
        }

        let request = ConsensusMessage::RequestVote {
            term,
            last_log_index: self.state.last_log_index(),
            last_log_term: self.state.last_log_term(),
        };
        let targets: Vec<NodeId> = self.others().cloned().collect();
        for to in targets {
            step.send(to, request.clone());
        }
    }

    fn become_follower<R: Rng + ?Sized>(
        &mut self,
        term: u64,
        now: Instant,
        rng: &mut R,
        step: &mut Step,
    ) {
        if self.role == Role::Leader {
            step.events.push(ElectionEvent::SteppedDown {
                term: self.state.current_term,
            });
        }
        self.state.current_term = term;
        self.state.voted_for = None;
        self.dirty = true;
        self.role = Role::Follower;
        self.leader = None;
        self.quorum = false;
        self.own_entry = None;
        self.progress.clear();
        self.reset_election_deadline(now, rng);
    }

    fn become_leader(&mut self, now: Instant, step: &mut Step) {
        let term = self.state.current_term;
        self.role = Role::Leader;
        self.leader = Some(self.id.clone());
        self.leader_since = now;
        self.quorum = true;

        let index = self.state.last_log_index() + 1;
        self.state.log.push(LogEntry {
            index,
            term,
            leader: self.id.clone(),
        });
        self.own_entry = Some(index);
        self.dirty = true;

        self.progress = self
            .others()
            .map(|id| {
                (
                    id.clone(),
                    Progress {
                        next_index: index,
                        match_index: 0,
                        last_ack: None,
                    },
                )
            })
            .collect();

        step.events.push(ElectionEvent::BecameLeader { term });
        step.events.push(ElectionEvent::LeaderChanged {
            term,
            leader: self.id.clone(),
        });

        self.advance_commit(step);
        self.broadcast_append(now, step);
    }

    fn broadcast_append(&mut self, now: Instant, step: &mut Step) {
        self.last_broadcast = Some(now);
        let term = self.state.current_term;
        for (to, progress) in &self.progress {
            let prev_log_index = progress.next_index.saturating_sub(1);
            let prev_log_term = self.state.term_at(prev_log_index).unwrap_or(0);
            let entries = self
                .state
                .log
                .iter()
                .skip(prev_log_index as usize)
                .cloned()
                .collect();
            step.send(
                to.clone(),
                ConsensusMessage::AppendEntries {
                    term,
                    prev_log_index,
                    prev_log_term,
                    entries,
                    leader_commit: self.commit_index,
                },
            );
        }
    }

    /// Returns false when the leader stepped down for lack of a quorum
    fn check_quorum(&mut self, now: Instant, step: &mut Step) -> bool {
        let window = self.timing.timeout_min;
        if now.saturating_duration_since(self.leader_since) < window {
            return true;
        }

        let reachable = 1 + self
            .progress
            .values()
            .filter(|p| {
                p.last_ack
                    .is_some_and(|at| now.saturating_duration_since(at) < window)
            })
            .count();

        if reachable >= self.quorum_size() {
            self.quorum = true;
            return true;
        }

        let term = self.state.current_term;
        tracing::warn!(
            error = %ClusterError::QuorumLost {
                term,
                reachable,
                voters: self.voters.len(),
            },
            "Stepping down"
        );
        step.events.push(ElectionEvent::QuorumLost { term, reachable });
        step.events.push(ElectionEvent::SteppedDown { term });
        self.role = Role::Follower;
        self.leader = None;
        self.quorum = false;
        self.own_entry = None;
        self.progress.clear();
        false
    }

    #[allow(clippy::too_many_arguments)]
    fn on_request_vote<R: Rng + ?Sized>(
        &mut self,
        from: &NodeId,
        term: u64,
        last_log_index: u64,
        last_log_term: u64,
        now: Instant,
        rng: &mut R,
        step: &mut Step,
    ) {
        let current = self.state.current_term;
        let up_to_date = (last_log_term, last_log_index)
            >= (self.state.last_log_term(), self.state.last_log_index());
        let free = match &self.state.voted_for {
            None => true,
            Some(v) => v == from,
        };

        let granted = term == current && free && up_to_date;
        if granted {
            if self.state.voted_for.is_none() {
                self.state.voted_for = Some(from.clone());
                self.dirty = true;
            }
            self.reset_election_deadline(now, rng);
        }

        tracing::debug!(candidate = %from, term, granted, "Vote requested");
        step.send(
            from.clone(),
            ConsensusMessage::Vote {
                term: current,
                granted,
            },
        );
    }

    fn on_vote(&mut self, from: &NodeId, term: u64, granted: bool, now: Instant, step: &mut Step) {
        if self.role != Role::Candidate || term != self.state.current_term || !granted {
            return;
        }
        self.votes.insert(from.clone());
        if self.votes.len() >= self.quorum_size() {
            self.become_leader(now, step);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_append<R: Rng + ?Sized>(
        &mut self,
        from: &NodeId,
        term: u64,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
        now: Instant,
        rng: &mut R,
        step: &mut Step,
    ) {
        let current = self.state.current_term;
        let reply = |success, match_index| ConsensusMessage::AppendResponse {
            term: current,
            success,
            match_index,
        };

        if term < current {
            step.send(from.clone(), reply(false, 0));
            return;
        }

        // Same term: a candidate yields to the elected leader
        if self.role == Role::Candidate {
            self.role = Role::Follower;
        }
        if self.leader.as_ref() != Some(from) {
            self.leader = Some(from.clone());
            step.events.push(ElectionEvent::LeaderChanged {
                term,
                leader: from.clone(),
            });
        }
        self.quorum = true;
        self.reset_election_deadline(now, rng);

        if self.state.term_at(prev_log_index) != Some(prev_log_term) {
            step.send(from.clone(), reply(false, 0));
            return;
        }

        let mut index = prev_log_index;
        for entry in entries {
            index = entry.index;
            match self.state.term_at(entry.index) {
                Some(t) if t == entry.term => {}
                Some(_) => {
                    self.state.log.truncate((entry.index - 1) as usize);
                    self.state.log.push(entry);
                    self.dirty = true;
                }
                None => {
                    self.state.log.push(entry);
                    self.dirty = true;
                }
            }
        }

        let new_commit = leader_commit.min(index);
        if new_commit > self.commit_index {
            self.commit_index = new_commit;
        }

        step.send(from.clone(), reply(true, index));
    }

    fn on_append_response(
        &mut self,
        from: &NodeId,
        term: u64,
        success: bool,
        match_index: u64,
        now: Instant,
        step: &mut Step,
    ) {
        if self.role != Role::Leader || term != self.state.current_term {
            return;
        }
        let Some(progress) = self.progress.get_mut(from) else {
            return;
        };

        progress.last_ack = Some(now);
        if success {
            progress.match_index = progress.match_index.max(match_index);
            progress.next_index = progress.match_index + 1;
            self.advance_commit(step);
        } else {
            progress.next_index = progress.next_index.saturating_sub(1).max(1);
        }
    }

    fn advance_commit(&mut self, step: &mut Step) {
        let term = self.state.current_term;
        let last = self.state.last_log_index();

        let mut n = last;
        while n > self.commit_index {
            let replicated = 1 + self.progress.values().filter(|p| p.match_index >= n).count();
            if replicated >= self.quorum_size() && self.state.term_at(n) == Some(term) {
                let was_owner = self.is_owner();
                self.commit_index = n;
                if !was_owner && self.is_owner() {
                    step.events.push(ElectionEvent::BecameOwner { term, index: n });
                }
                break;
            }
            n -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn timing() -> ElectionTiming {
        ElectionTiming {
            timeout_min: Duration::from_millis(150),
            timeout_max: Duration::from_millis(300),
            heartbeat: Duration::from_millis(50),
        }
    }

    fn ids() -> Vec<NodeId> {
        vec![NodeId::new("a"), NodeId::new("b"), NodeId::new("c")]
    }

    fn node(name: &str, now: Instant, rng: &mut StdRng) -> Election {
        Election::new(
            NodeId::new(name),
            ids(),
            PersistentState::default(),
            timing(),
            now,
            rng,
        )
        .unwrap()
    }

    fn message_to<'a>(step: &'a Step, to: &str) -> &'a ConsensusMessage {
        &step
            .messages
            .iter()
            .find(|(id, _)| id.as_str() == to)
            .unwrap()
            .1
    }

    #[test]
    fn test_single_voter_elects_and_owns_itself() {
        let mut rng = StdRng::seed_from_u64(1);
        let now = Instant::now();
        let mut e = Election::new(
            NodeId::new("solo"),
            vec![NodeId::new("solo")],
            PersistentState::default(),
            timing(),
            now,
            &mut rng,
        )
        .unwrap();

        assert!(!e.is_owner());
        let step = e.tick(now + Duration::from_millis(300), &mut rng);
        assert!(step.events.contains(&ElectionEvent::BecameOwner { term: 1, index: 1 }));
        assert!(e.is_owner());
        assert_eq!(step.persist.as_ref().unwrap().current_term, 1);
        assert_eq!(e.committed().len(), 1);
    }

    #[test]
    fn test_not_a_voter_rejected() {
        let mut rng = StdRng::seed_from_u64(1);
        let err = Election::new(
            NodeId::new("x"),
            ids(),
            PersistentState::default(),
            timing(),
            Instant::now(),
            &mut rng,
        )
        .unwrap_err();
        assert!(matches!(err, ClusterError::NotVoter(_)));
    }

    #[test]
    fn test_owner_only_after_commit() {
        let mut rng = StdRng::seed_from_u64(2);
        let t0 = Instant::now();
        let mut a = node("a", t0, &mut rng);
        let mut b = node("b", t0, &mut rng);

        let t1 = t0 + Duration::from_millis(300);
        let step = a.tick(t1, &mut rng);
        assert_eq!(a.role(), Role::Candidate);
        assert_eq!(step.persist.as_ref().unwrap().voted_for, Some(NodeId::new("a")));
        let request = message_to(&step, "b").clone();

        let vote = b.handle(&NodeId::new("a"), request, t1, &mut rng);
        // The vote is persisted before it is sent
        assert_eq!(vote.persist.as_ref().unwrap().voted_for, Some(NodeId::new("a")));
        let vote = message_to(&vote, "a").clone();

        let step = a.handle(&NodeId::new("b"), vote, t1, &mut rng);
        assert_eq!(a.role(), Role::Leader);
        assert!(step.events.contains(&ElectionEvent::BecameLeader { term: 1 }));
        assert!(!a.is_owner());
        assert!(!a.snapshot().owner);

        let append = message_to(&step, "b").clone();
        let ack = b.handle(&NodeId::new("a"), append, t1, &mut rng);
        assert_eq!(b.leader(), Some(&NodeId::new("a")));
        assert_eq!(b.state().log.len(), 1);
        let ack = message_to(&ack, "a").clone();

        let step = a.handle(&NodeId::new("b"), ack, t1, &mut rng);
        assert!(step.events.contains(&ElectionEvent::BecameOwner { term: 1, index: 1 }));
        assert!(a.snapshot().is_owner());
    }

    #[test]
    fn test_one_vote_per_term() {
        let mut rng = StdRng::seed_from_u64(3);
        let now = Instant::now();
        let mut c = node("c", now, &mut rng);
        let request = ConsensusMessage::RequestVote {
            term: 1,
            last_log_index: 0,
            last_log_term: 0,
        };

        let first = c.handle(&NodeId::new("a"), request.clone(), now, &mut rng);
        assert_eq!(
            message_to(&first, "a"),
            &ConsensusMessage::Vote {
                term: 1,
                granted: true
            }
        );
        let second = c.handle(&NodeId::new("b"), request, now, &mut rng);
        assert_eq!(
            message_to(&second, "b"),
            &ConsensusMessage::Vote {
                term: 1,
                granted: false
            }
        );
    }

    #[test]
    fn test_stale_log_candidate_denied() {
        let mut rng = StdRng::seed_from_u64(4);
        let now = Instant::now();
        let state = PersistentState {
            current_term: 2,
            voted_for: None,
            log: vec![LogEntry {
                index: 1,
                term: 2,
                leader: NodeId::new("a"),
            }],
        };
        let mut c = Election::new(NodeId::new("c"), ids(), state, timing(), now, &mut rng).unwrap();

        let step = c.handle(
            &NodeId::new("b"),
            ConsensusMessage::RequestVote {
                term: 3,
                last_log_index: 0,
                last_log_term: 0,
            },
            now,
            &mut rng,
        );
        assert_eq!(
            message_to(&step, "b"),
            &ConsensusMessage::Vote {
                term: 3,
                granted: false
            }
        );
        assert_eq!(c.term(), 3);
    }

    #[test]
    fn test_higher_term_forces_step_down() {
        let mut rng = StdRng::seed_from_u64(5);
        let now = Instant::now();
        let mut a = node("a", now, &mut rng);
        let t1 = now + Duration::from_millis(300);
        a.tick(t1, &mut rng);
        a.handle(
            &NodeId::new("b"),
            ConsensusMessage::Vote {
                term: 1,
                granted: true,
            },
            t1,
            &mut rng,
        );
        assert_eq!(a.role(), Role::Leader);

        let step = a.handle(
            &NodeId::new("c"),
            ConsensusMessage::AppendEntries {
                term: 4,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![],
                leader_commit: 0,
            },
            t1,
            &mut rng,
        );
        assert!(step.events.contains(&ElectionEvent::SteppedDown { term: 1 }));
        assert_eq!(a.role(), Role::Follower);
        assert_eq!(a.term(), 4);
        assert_eq!(a.leader(), Some(&NodeId::new("c")));
        assert!(!a.is_owner());
    }

    #[test]
    fn test_leader_steps_down_without_quorum() {
        let mut rng = StdRng::seed_from_u64(6);
        let t0 = Instant::now();
        let mut a = node("a", t0, &mut rng);
        let t1 = t0 + Duration::from_millis(300);
        a.tick(t1, &mut rng);
        a.handle(
            &NodeId::new("b"),
            ConsensusMessage::Vote {
                term: 1,
                granted: true,
            },
            t1,
            &mut rng,
        );
        a.handle(
            &NodeId::new("b"),
            ConsensusMessage::AppendResponse {
                term: 1,
                success: true,
                match_index: 1,
            },
            t1,
            &mut rng,
        );
        assert!(a.is_owner());

        // Within the window the leader keeps its quorum
        let step = a.tick(t1 + Duration::from_millis(100), &mut rng);
        assert!(step.events.is_empty());
        assert!(a.is_owner());

        // No acks for longer than the minimum election timeout
        let step = a.tick(t1 + Duration::from_millis(200), &mut rng);
        assert!(step
            .events
            .contains(&ElectionEvent::QuorumLost { term: 1, reachable: 1 }));
        assert_eq!(a.role(), Role::Follower);
        assert!(!a.snapshot().is_owner());
    }

    #[test]
    fn test_conflicting_entries_are_replaced() {
        let mut rng = StdRng::seed_from_u64(7);
        let now = Instant::now();
        let state = PersistentState {
            current_term: 2,
            voted_for: None,
            log: vec![
                LogEntry {
                    index: 1,
                    term: 1,
                    leader: NodeId::new("a"),
                },
                LogEntry {
                    index: 2,
                    term: 2,
                    leader: NodeId::new("c"),
                },
            ],
        };
        let mut c = Election::new(NodeId::new("c"), ids(), state, timing(), now, &mut rng).unwrap();

        let entry = LogEntry {
            index: 2,
            term: 3,
            leader: NodeId::new("b"),
        };
        let step = c.handle(
            &NodeId::new("b"),
            ConsensusMessage::AppendEntries {
                term: 3,
                prev_log_index: 1,
                prev_log_term: 1,
                entries: vec![entry.clone()],
                leader_commit: 2,
            },
            now,
            &mut rng,
        );
        assert_eq!(c.state().log[1], entry);
        assert_eq!(c.commit_index(), 2);
        assert!(step.persist.is_some());
        assert_eq!(
            message_to(&step, "b"),
            &ConsensusMessage::AppendResponse {
                term: 3,
                success: true,
                match_index: 2
            }
        );
    }
}
