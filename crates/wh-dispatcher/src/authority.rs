//! Registration admission
//!
//! The dispatcher cannot see the cluster directly. A [`LeadershipAuthority`]
//! decides whether a connector claiming leadership in some term may own
//! the tunnel.

use std::sync::Mutex;

use tokio::sync::watch;
use wh_core::{LeadershipSnapshot, NodeId};

/// Decides whether a registration may become the active session
pub trait LeadershipAuthority: Send + Sync {
    /// Accept or reject `node` claiming leadership in `term`.
    ///
    /// On rejection returns the reason sent back to the connector.
    fn admit(&self, node: &NodeId, term: u64) -> Result<(), String>;
}

/// Monotonic term fencing.
///
/// Terms only move forward: a registration with a lower term than the
/// highest one admitted so far is stale, and a term already claimed by
/// another node is a conflict. A higher term supersedes everything before
/// it.
#[derive(Debug, Default)]
pub struct TermFence {
    highest: Mutex<Option<(u64, NodeId)>>,
}

impl TermFence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest admitted term and its holder
    pub fn current(&self) -> Option<(u64, NodeId)> {
        self.highest.lock().ok().and_then(|h| h.clone())
    }
}

impl LeadershipAuthority for TermFence {
    fn admit(&self, node: &NodeId, term: u64) -> Result<(), String> {
        let mut highest = self
            .highest
            .lock()
            .map_err(|_| "term fence unavailable".to_string())?;

        match highest.as_ref() {
            Some((t, _)) if term < *t => Err(format!("stale term {} (current term is {})", term, t)),
            Some((t, holder)) if term == *t && holder != node => {
                Err(format!("term {} is already held by {}", term, holder))
            }
            _ => {
                *highest = Some((term, node.clone()));
                Ok(())
            }
        }
    }
}

/// Exact validation against a co-located cluster member's view
impl LeadershipAuthority for watch::Receiver<LeadershipSnapshot> {
    fn admit(&self, node: &NodeId, term: u64) -> Result<(), String> {
        let snapshot = self.borrow();
        if snapshot.is_leader(node, term) {
            Ok(())
        } else {
            Err(match &snapshot.leader {
                Some(leader) => format!(
                    "{} is not leader of term {} (leader is {} in term {})",
                    node, term, leader, snapshot.term
                ),
                None => format!("no leader known for term {}", term),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_term_fence_orders_terms() {
        let fence = TermFence::new();
        let a = NodeId::new("edge-a:1111");
        let b = NodeId::new("edge-b:1111");

        assert!(fence.admit(&a, 3).is_ok());
        // Reconnect in the same term
        assert!(fence.admit(&a, 3).is_ok());
        // Another node cannot claim the same term
        assert!(fence.admit(&b, 3).unwrap_err().contains("already held"));
        // Stale term
        assert!(fence.admit(&b, 2).unwrap_err().contains("stale"));
        // Higher term supersedes
        assert!(fence.admit(&b, 4).is_ok());
        assert!(fence.admit(&a, 3).is_err());
        assert_eq!(fence.current(), Some((4, b)));
    }

    #[test]
    fn test_snapshot_authority() {
        let (tx, rx) = watch::channel(LeadershipSnapshot::default());
        let a = NodeId::new("edge-a:1111");

        assert!(rx.admit(&a, 1).is_err());

        tx.send_replace(LeadershipSnapshot {
            term: 2,
            leader: Some(a.clone()),
            ..Default::default()
        });
        assert!(rx.admit(&a, 2).is_ok());
        assert!(rx.admit(&a, 1).is_err());
        assert!(rx.admit(&NodeId::new("edge-b:1111"), 2).is_err());
    }
}
