//! wh-cluster: Membership and leader election for wormhole
//!
//! Two independent protocols run side by side:
//!
//! - **Membership** ([`membership`]): SWIM-style gossip over UDP that
//!   tracks which peers are alive. It never decides leadership.
//! - **Election** ([`election`]): majority-quorum leader election among the
//!   configured voters. A leader appends a leadership-change entry to a
//!   replicated log and becomes the tunnel *owner* only once that entry is
//!   committed.
//!
//! Both are pure state machines with the clock passed in. [`ClusterNode`]
//! drives them from sockets and timers and publishes read-only snapshots.

pub mod election;
pub mod error;
pub mod membership;
pub mod node;
pub mod store;
pub mod wire;

pub use election::{ConsensusMessage, Election, ElectionEvent, ElectionTiming, LogEntry, Role, Step};
pub use error::ClusterError;
pub use membership::{Membership, MembershipConfig, MembershipEvent, Peer, PeerDigest, PeerStatus};
pub use node::ClusterNode;
pub use store::{FileStateStore, MemoryStateStore, PersistentState, StateStore};
