//! wh-dispatcher: Central side of the wormhole reverse tunnel
//!
//! The dispatcher accepts TLS connections from connectors, admits the one
//! that currently leads the cluster, and multiplexes external requests as
//! streams over that session. When leadership moves, the old session is
//! fenced off before the new one takes traffic.

pub mod authority;
pub mod dispatcher;
mod server;
pub mod session;

pub use authority::{LeadershipAuthority, TermFence};
pub use dispatcher::{Dispatcher, MAX_RESPONSE_SIZE};
pub use session::{Session, SessionEvent, SessionLimits, SessionManager, Stream};
