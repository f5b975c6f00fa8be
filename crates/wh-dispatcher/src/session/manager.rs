//! Session manager implementation

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use wh_core::{DispatchError, NodeId, SessionId};
use wh_protocol::Frame;

use super::{Session, SessionLimits};
use crate::authority::LeadershipAuthority;

/// Session lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Opened {
        id: SessionId,
        node: NodeId,
        term: u64,
    },
    Closed {
        id: SessionId,
        node: NodeId,
        term: u64,
        reason: String,
    },
}

/// Tracks registered sessions and which one currently owns the tunnel
pub struct SessionManager {
    /// Sessions indexed by session ID
    sessions: DashMap<SessionId, Arc<Session>>,
    /// Session new streams are opened on
    owner: watch::Sender<Option<Arc<Session>>>,
    events: broadcast::Sender<SessionEvent>,
    next_id: AtomicU64,
    /// Serializes admission so fencing and publication cannot interleave
    admission: Mutex<()>,
}

impl SessionManager {
    /// Create a new session manager
    pub fn new() -> Self {
        let (owner, _) = watch::channel(None);
        let (events, _) = broadcast::channel(64);
        Self {
            sessions: DashMap::new(),
            owner,
            events,
            next_id: AtomicU64::new(1),
            admission: Mutex::new(()),
        }
    }

    /// Admit a registration and make it the owning session.
    ///
    /// Every other session is torn down before the new one is published.
    pub fn register(
        &self,
        authority: &dyn LeadershipAuthority,
        node: NodeId,
        term: u64,
        fingerprint: Option<String>,
        limits: SessionLimits,
        outbound: mpsc::Sender<Frame>,
    ) -> Result<Arc<Session>, String> {
        let _guard = self
            .admission
            .lock()
            .map_err(|_| "admission unavailable".to_string())?;

        authority.admit(&node, term)?;

        let reason = format!("superseded by {} in term {}", node, term);
        for old in self.list() {
            self.close(&old, &reason);
        }

        let id = SessionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let session = Arc::new(Session::new(
            id,
            node.clone(),
            term,
            fingerprint,
            limits,
            outbound,
        ));
        self.sessions.insert(id, Arc::clone(&session));
        self.owner.send_replace(Some(Arc::clone(&session)));

        tracing::info!(session = %id, %node, term, "Session registered");
        let _ = self.events.send(SessionEvent::Opened { id, node, term });
        Ok(session)
    }

    /// Tear a session down. Only the first call for a session has effect.
    pub fn close(&self, session: &Arc<Session>, reason: &str) {
        if !session.close(reason) {
            return;
        }
        self.sessions.remove(&session.id);
        self.clear_owner(session);

        tracing::info!(session = %session.id, node = %session.node, reason, "Session closed");
        let _ = self.events.send(SessionEvent::Closed {
            id: session.id,
            node: session.node.clone(),
            term: session.term,
            reason: reason.to_string(),
        });
    }

    /// Stop opening streams on `session`; it closes once its streams finish
    pub fn drain(&self, session: &Arc<Session>, reason: &str) {
        if session.start_drain() {
            tracing::info!(session = %session.id, reason, "Session draining");
        }
        self.clear_owner(session);
        if session.open_streams() == 0 {
            self.close(session, "drained");
        }
    }

    /// Close every session
    pub fn close_all(&self, reason: &str) {
        for session in self.list() {
            self.close(&session, reason);
        }
    }

    fn clear_owner(&self, session: &Arc<Session>) {
        self.owner.send_if_modified(|owner| match owner {
            Some(current) if current.id == session.id => {
                *owner = None;
                true
            }
            _ => false,
        });
    }

    /// The owning session, waiting up to `timeout` for one to register
    pub async fn wait_owner(&self, timeout: Duration) -> Result<Arc<Session>, DispatchError> {
        let mut rx = self.owner.subscribe();
        let wait = rx.wait_for(|owner| owner.as_ref().is_some_and(|s| s.is_accepting()));

        let owner = match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(owner)) => owner.clone(),
            _ => None,
        };
        owner.ok_or(DispatchError::Unavailable)
    }

    /// Current owning session
    pub fn owner(&self) -> Option<Arc<Session>> {
        self.owner.borrow().clone()
    }

    /// Get a session by ID
    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|r| Arc::clone(&r))
    }

    /// List all sessions
    pub fn list(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|r| Arc::clone(&r)).collect()
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Number of active sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}
