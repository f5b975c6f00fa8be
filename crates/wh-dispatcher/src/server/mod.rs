//! Network listeners
//!
//! - `tunnel`: TLS listener for connectors; registration and the session
//!   read/write loops.
//! - `front`: plain TCP listener for external clients; each connection is
//!   relayed over one stream.

mod front;
mod tunnel;
