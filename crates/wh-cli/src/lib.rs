//! wormhole: Highly-available reverse tunnel
//!
//! Wires the cluster, connector and dispatcher crates into runnable roles
//! and owns the ordered shutdown of everything a role started.

pub mod cli;
pub mod direct;
pub mod lifecycle;
pub mod output;
mod runtime;

pub use runtime::{start, start_dispatcher, BoundAddrs, RunningHandle};
