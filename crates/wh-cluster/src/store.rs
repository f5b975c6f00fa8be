//! Durable consensus state
//!
//! Term, vote and the leadership log must survive restarts so that a node
//! never votes twice in one term. [`FileStateStore`] writes
//! `state_dir/consensus.json` atomically (temp file, fsync, rename).

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use wh_core::NodeId;

use crate::election::LogEntry;
use crate::error::ClusterError;

/// File name of the persisted state inside `state_dir`
pub const STATE_FILE: &str = "consensus.json";

/// Everything the election layer must persist before acting on it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentState {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
    pub log: Vec<LogEntry>,
}

impl PersistentState {
    pub fn last_log_index(&self) -> u64 {
        self.log.last().map(|e| e.index).unwrap_or(0)
    }

    pub fn last_log_term(&self) -> u64 {
        self.log.last().map(|e| e.term).unwrap_or(0)
    }

    /// Term of the entry at `index` (0 for the empty prefix)
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        self.entry(index).map(|e| e.term)
    }

    pub fn entry(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.log.get((index - 1) as usize)
    }
}

/// Storage backend for [`PersistentState`]
pub trait StateStore: Send {
    /// Load the last saved state, `None` if nothing was ever saved
    fn load(&self) -> Result<Option<PersistentState>, ClusterError>;

    /// Durably replace the saved state
    fn save(&mut self, state: &PersistentState) -> Result<(), ClusterError>;
}

/// JSON file store
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    /// Store at `state_dir/consensus.json`, creating the directory
    pub fn open(state_dir: &Path) -> Result<Self, ClusterError> {
        fs::create_dir_all(state_dir)
            .map_err(|e| ClusterError::state(state_dir, format!("cannot create directory: {}", e)))?;
        Ok(Self {
            path: state_dir.join(STATE_FILE),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> Result<Option<PersistentState>, ClusterError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ClusterError::state(&self.path, e.to_string())),
        };

        let state: PersistentState = serde_json::from_str(&content)
            .map_err(|e| ClusterError::state(&self.path, format!("corrupt state: {}", e)))?;

        for (i, entry) in state.log.iter().enumerate() {
            if entry.index != i as u64 + 1 {
                return Err(ClusterError::state(
                    &self.path,
                    format!("log entry {} has index {}", i + 1, entry.index),
                ));
            }
        }

        tracing::debug!(
            path = %self.path.display(),
            term = state.current_term,
            entries = state.log.len(),
            "Loaded consensus state"
        );
        Ok(Some(state))
    }

    fn save(&mut self, state: &PersistentState) -> Result<(), ClusterError> {
        let tmp = self.path.with_extension("json.tmp");
        let err = |e: std::io::Error| ClusterError::state(&self.path, e.to_string());

        let json = serde_json::to_vec_pretty(state)
            .map_err(|e| ClusterError::state(&self.path, e.to_string()))?;

        let mut file = fs::File::create(&tmp).map_err(err)?;
        file.write_all(&json).map_err(err)?;
        file.sync_all().map_err(err)?;
        drop(file);

        fs::rename(&tmp, &self.path).map_err(err)?;
        Ok(())
    }
}

/// In-memory store. Clones share the same slot, so a test can keep one
/// handle and "restart" a node with another.
#[derive(Debug, Clone, Default)]
pub struct MemoryStateStore {
    slot: Arc<Mutex<Option<PersistentState>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last saved state
    pub fn current(&self) -> Option<PersistentState> {
        self.slot.lock().ok().and_then(|s| s.clone())
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<Option<PersistentState>, ClusterError> {
        self.slot
            .lock()
            .map(|s| s.clone())
            .map_err(|_| ClusterError::state("memory", "lock poisoned"))
    }

    fn save(&mut self, state: &PersistentState) -> Result<(), ClusterError> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| ClusterError::state("memory", "lock poisoned"))?;
        *slot = Some(state.clone());
        Ok(())
    }
}
