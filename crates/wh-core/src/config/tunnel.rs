//! Tunnel client and dispatcher configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::{duration_millis, duration_secs};

/// Settings of the edge-side tunnel client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Backoff between dial attempts
    pub backoff: BackoffConfig,

    /// Time in-flight streams get to finish when the session drains
    #[serde(with = "duration_secs")]
    pub drain_grace: Duration,

    /// Largest data chunk placed in a single frame
    pub max_frame_size: usize,

    /// Receive window per stream: `Data` frames the peer may send before
    /// we hand credit back
    pub stream_buffer: usize,

    /// The session is considered lost after this long without frames
    #[serde(with = "duration_secs")]
    pub idle_timeout: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            drain_grace: Duration::from_secs(10),
            max_frame_size: 64 * 1024,
            stream_buffer: 64,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Settings of the central dispatcher
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Host both dispatcher listeners bind to
    pub bind_host: String,

    /// Upper bound of concurrently open streams per session
    pub max_streams_per_session: usize,

    /// How long a request waits for a free stream slot
    #[serde(with = "duration_millis")]
    pub stream_acquire_timeout: Duration,

    /// How long a request waits for a tunnel owner to register
    #[serde(with = "duration_millis")]
    pub owner_wait_timeout: Duration,

    /// Deadline given to streams opened from the front listener
    #[serde(with = "duration_secs")]
    pub stream_timeout: Duration,

    /// Sessions without inbound traffic for this long are torn down
    #[serde(with = "duration_secs")]
    pub idle_timeout: Duration,

    /// Interval of dispatcher heartbeats
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,

    /// Time a new connection has to complete TLS and register
    #[serde(with = "duration_secs")]
    pub register_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            max_streams_per_session: 256,
            stream_acquire_timeout: Duration::from_secs(5),
            owner_wait_timeout: Duration::from_secs(10),
            stream_timeout: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(90),
            heartbeat_interval: Duration::from_secs(30),
            register_timeout: Duration::from_secs(10),
        }
    }
}

/// Exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Initial delay
    #[serde(with = "duration_millis")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "duration_millis")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

impl BackoffConfig {
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.multiplier < 1.0 {
            return Err("tunnel.backoff.multiplier must be at least 1.0".into());
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err("tunnel.backoff.jitter must be within 0.0..=1.0".into());
        }
        if self.initial.is_zero() || self.initial > self.max {
            return Err("tunnel.backoff.initial must be non-zero and not above max".into());
        }
        Ok(())
    }
}
