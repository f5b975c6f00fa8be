//! Command-line surface
//!
//! Every flag mirrors a [`Config`] field and overrides the value read from
//! the configuration file.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use wh_core::config::{config_search_paths, find_config, load_config};
use wh_core::Config;

#[derive(Parser, Debug)]
#[command(name = "wormhole")]
#[command(author, version, about = "Highly-available reverse tunnel")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, env = "WORMHOLE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, action = clap::ArgAction::Count, conflicts_with = "quiet")]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a connector node next to the protected service
    Connector(NodeArgs),

    /// Run the central dispatcher
    Dispatcher(NodeArgs),
}

impl Commands {
    pub fn args(&self) -> &NodeArgs {
        match self {
            Commands::Connector(args) | Commands::Dispatcher(args) => args,
        }
    }
}

/// Overrides shared by both roles
#[derive(Args, Debug, Default)]
pub struct NodeArgs {
    /// Dispatcher host the connector dials
    #[arg(long)]
    pub remote_host: Option<String>,

    /// External-facing tunnel port
    #[arg(long)]
    pub tunnel_port: Option<u16>,

    /// Reverse-tunnel port connectors dial
    #[arg(long)]
    pub reverse_tunnel_port: Option<u16>,

    /// Connect timeout in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Gossip addresses of the other cluster members
    #[arg(long, value_delimiter = ',', value_name = "HOST:PORT")]
    pub peers: Option<Vec<String>>,

    /// UDP port for gossip membership
    #[arg(long)]
    pub gossip_port: Option<u16>,

    /// UDP port for leader election
    #[arg(long)]
    pub consensus_port: Option<u16>,

    /// Host other members use to reach this node
    #[arg(long)]
    pub advertise_host: Option<String>,

    /// Local service address
    #[arg(long, value_name = "HOST:PORT")]
    pub local_addr: Option<String>,

    /// Directory for persisted consensus state
    #[arg(long)]
    pub state_dir: Option<PathBuf>,

    /// CA certificate used to verify the peer
    #[arg(long)]
    pub trust_ca_file: Option<PathBuf>,

    /// Skip certificate verification
    #[arg(long)]
    pub insecure: bool,

    /// Certificate presented by this process
    #[arg(long)]
    pub cert_file: Option<PathBuf>,

    /// Private key for --cert-file
    #[arg(long)]
    pub key_file: Option<PathBuf>,

    /// Serve the local service directly over TLS
    #[arg(long)]
    pub direct_serve: bool,
}

impl NodeArgs {
    /// Apply every flag that was given
    pub fn apply(&self, config: &mut Config) {
        if let Some(host) = &self.remote_host {
            config.remote_host = host.clone();
        }
        if let Some(port) = self.tunnel_port {
            config.tunnel_port = port;
        }
        if let Some(port) = self.reverse_tunnel_port {
            config.reverse_tunnel_port = port;
        }
        if let Some(secs) = self.timeout {
            config.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(peers) = &self.peers {
            config.cluster.peers = peers.clone();
        }
        if let Some(port) = self.gossip_port {
            config.cluster.gossip_port = port;
        }
        if let Some(port) = self.consensus_port {
            config.cluster.consensus_port = port;
        }
        if let Some(host) = &self.advertise_host {
            config.cluster.advertise_host = host.clone();
        }
        if let Some(addr) = &self.local_addr {
            config.local_addr = addr.clone();
        }
        if let Some(dir) = &self.state_dir {
            config.state_dir = dir.clone();
        }
        if let Some(ca) = &self.trust_ca_file {
            config.tls.trust_ca_file = Some(ca.clone());
        }
        if self.insecure {
            config.tls.insecure = true;
        }
        if let Some(cert) = &self.cert_file {
            config.tls.cert_file = cert.clone();
        }
        if let Some(key) = &self.key_file {
            config.tls.key_file = key.clone();
        }
        if self.direct_serve {
            config.direct_serve = true;
        }
    }
}

impl Cli {
    /// Filter directive used when `RUST_LOG` is not set
    pub fn log_level(&self) -> &'static str {
        match (self.quiet, self.verbose) {
            (true, _) => "error",
            (false, 0) => "info",
            (false, 1) => "debug",
            (false, _) => "trace",
        }
    }

    /// Build the final configuration: file (explicit, or the first of
    /// `/etc/wormhole-connector` and the user config dir holding a
    /// `connector.toml`), then flags, then validation
    pub fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => load_config(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => match find_config(&config_search_paths()) {
                Some(path) => {
                    tracing::info!("Using config file {}", path.display());
                    load_config(path)
                        .with_context(|| format!("Failed to load config from {}", path.display()))?
                }
                None => Config::default(),
            },
        };

        self.command.args().apply(&mut config);
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}
