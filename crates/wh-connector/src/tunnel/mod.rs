//! Tunnel management for connecting to the dispatcher

mod client;
mod dialer;
mod reconnect;

pub use client::TunnelClient;
pub use dialer::{BoxedIo, Dialer, TlsDialer, TunnelIo};
pub use reconnect::ExponentialBackoff;
