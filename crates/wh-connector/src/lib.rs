//! wh-connector: Edge side of the wormhole reverse tunnel
//!
//! The connector runs next to the protected service. While the local
//! cluster node owns the tunnel it dials the dispatcher, registers with its
//! consensus term, and forwards every stream it is handed to the local
//! service. When leadership moves elsewhere it drains and steps aside.

pub mod error;
mod forward;
pub mod tunnel;

pub use error::ConnectionError;
pub use tunnel::{BoxedIo, Dialer, ExponentialBackoff, TlsDialer, TunnelClient, TunnelIo};
