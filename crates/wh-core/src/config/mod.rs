//! Configuration management for wormhole
//!
//! A [`Config`] is built once by the outer layer (file plus command-line
//! overrides), validated, and then handed to every component by value or
//! behind an `Arc`. Nothing reads configuration from global state.

mod cluster;
pub mod serde_utils;
mod tunnel;

pub use cluster::ClusterConfig;
pub use tunnel::{BackoffConfig, DispatcherConfig, TunnelConfig};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::tls::TrustMode;
use serde_utils::duration_secs;

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("wormhole-connector")
}

/// Get the default configuration file path
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("connector.toml")
}

/// System-wide configuration directory
pub const SYSTEM_CONFIG_DIR: &str = "/etc/wormhole-connector";

/// Files consulted when no config is given explicitly, first match wins
pub fn config_search_paths() -> Vec<PathBuf> {
    vec![
        Path::new(SYSTEM_CONFIG_DIR).join("connector.toml"),
        default_config_path(),
    ]
}

/// First existing file among `candidates`
pub fn find_config(candidates: &[PathBuf]) -> Option<&Path> {
    candidates
        .iter()
        .map(PathBuf::as_path)
        .find(|path| path.is_file())
}

/// Complete, immutable process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host of the dispatcher the connector dials
    pub remote_host: String,

    /// Port of the dispatcher's external-facing listener
    pub tunnel_port: u16,

    /// Port of the dispatcher's reverse-tunnel listener
    pub reverse_tunnel_port: u16,

    /// Local service streams are forwarded to
    pub local_addr: String,

    /// Bound on one dial attempt (TCP connect plus TLS handshake)
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Directory holding persisted consensus state
    pub state_dir: PathBuf,

    /// Serve `local_addr` directly over TLS, without tunnel or cluster
    pub direct_serve: bool,

    /// Deadline for the graceful part of shutdown
    #[serde(with = "duration_secs")]
    pub shutdown_grace: Duration,

    /// TLS material
    pub tls: TlsConfig,

    /// Membership and election
    pub cluster: ClusterConfig,

    /// Edge-side tunnel client
    pub tunnel: TunnelConfig,

    /// Central dispatcher
    pub dispatcher: DispatcherConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            remote_host: "localhost".to_string(),
            tunnel_port: 9090,
            reverse_tunnel_port: 9091,
            local_addr: "127.0.0.1:8080".to_string(),
            connect_timeout: Duration::from_secs(300),
            state_dir: default_config_dir(),
            direct_serve: false,
            shutdown_grace: Duration::from_secs(5),
            tls: TlsConfig::default(),
            cluster: ClusterConfig::default(),
            tunnel: TunnelConfig::default(),
            dispatcher: DispatcherConfig::default(),
        }
    }
}

impl Config {
    /// Address the connector dials
    pub fn reverse_tunnel_address(&self) -> String {
        format!("{}:{}", self.remote_host, self.reverse_tunnel_port)
    }

    /// Dispatcher reverse-tunnel listener address
    pub fn reverse_tunnel_bind(&self) -> String {
        format!("{}:{}", self.dispatcher.bind_host, self.reverse_tunnel_port)
    }

    /// Dispatcher front listener address (also used by direct-serve mode)
    pub fn tunnel_bind(&self) -> String {
        format!("{}:{}", self.dispatcher.bind_host, self.tunnel_port)
    }

    /// Check values that would make the components misbehave
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = ConfigError::Invalid;

        if self.remote_host.trim().is_empty() {
            return Err(invalid("remote_host must not be empty".into()));
        }
        if self.local_addr.trim().is_empty() {
            return Err(invalid("local_addr must not be empty".into()));
        }
        if self.connect_timeout.is_zero() {
            return Err(invalid("connect_timeout must be non-zero".into()));
        }
        if self.dispatcher.max_streams_per_session == 0 {
            return Err(invalid("dispatcher.max_streams_per_session must be at least 1".into()));
        }
        if self.tunnel.max_frame_size == 0
            || self.tunnel.max_frame_size > wh_protocol::MAX_PAYLOAD_SIZE / 2
        {
            return Err(invalid(format!(
                "tunnel.max_frame_size must be within 1..={}",
                wh_protocol::MAX_PAYLOAD_SIZE / 2
            )));
        }
        if self.tunnel.stream_buffer == 0 {
            return Err(invalid("tunnel.stream_buffer must be at least 1".into()));
        }
        if self.tunnel.idle_timeout <= self.dispatcher.heartbeat_interval {
            return Err(invalid(
                "tunnel.idle_timeout must exceed dispatcher.heartbeat_interval".into(),
            ));
        }
        if self.tls.insecure && self.tls.trust_ca_file.is_some() {
            return Err(invalid("tls.insecure and tls.trust_ca_file are mutually exclusive".into()));
        }
        self.tunnel.backoff.validate().map_err(invalid)?;
        self.cluster.validate().map_err(invalid)?;
        Ok(())
    }
}

/// TLS material locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Custom CA used to verify the dispatcher (and, on the dispatcher,
    /// connector client certificates)
    pub trust_ca_file: Option<PathBuf>,

    /// Accept any dispatcher certificate
    pub insecure: bool,

    /// Certificate chain presented by this process
    pub cert_file: PathBuf,

    /// Private key matching `cert_file`
    pub key_file: PathBuf,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            trust_ca_file: None,
            insecure: false,
            cert_file: PathBuf::from("connector.pem"),
            key_file: PathBuf::from("connector-key.pem"),
        }
    }
}

impl TlsConfig {
    /// How the dispatcher's certificate is verified
    pub fn trust_mode(&self) -> TrustMode {
        if self.insecure {
            TrustMode::Insecure
        } else if let Some(ca) = &self.trust_ca_file {
            TrustMode::CustomCa(ca.clone())
        } else {
            TrustMode::SystemRoots
        }
    }
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read {}: {}", path.display(), e)))?;

    Ok(toml::from_str(&content)?)
}

/// Save configuration to a file
pub fn save_config<T: serde::Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::Invalid(format!("Failed to create config dir: {}", e)))?;
    }

    std::fs::write(path, content)
        .map_err(|e| ConfigError::Invalid(format!("Failed to write config: {}", e)))?;

    Ok(())
}
