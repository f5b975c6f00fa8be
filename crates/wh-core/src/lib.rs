//! wh-core: Shared configuration, types and transport for wormhole
//!
//! This crate provides the immutable configuration object, the error
//! taxonomy, the leadership snapshot shared between the cluster layer and
//! the tunnel components, and the TLS transport manager.

pub mod config;
pub mod error;
pub mod tls;
pub mod types;

pub use config::Config;
pub use error::{ConfigError, DispatchError, TransportError, WhError};
pub use types::{LeadershipSnapshot, NodeId, SessionId, TunnelState};
