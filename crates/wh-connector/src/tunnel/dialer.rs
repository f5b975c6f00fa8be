//! Outbound connections to the dispatcher

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use wh_core::tls::{Identity, TlsClient};
use wh_core::{Config, ConfigError, TransportError};

/// Byte stream the tunnel runs over
pub trait TunnelIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> TunnelIo for T {}

pub type BoxedIo = Box<dyn TunnelIo>;

/// Opens one connection to the dispatcher per call
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self) -> Result<BoxedIo, TransportError>;

    /// Where this dialer connects, for logs
    fn target(&self) -> String;
}

/// Dials the dispatcher's reverse-tunnel port over TLS
pub struct TlsDialer {
    client: TlsClient,
    addr: String,
    server_name: String,
    timeout: Duration,
}

impl TlsDialer {
    pub fn new(client: TlsClient, addr: String, server_name: String, timeout: Duration) -> Self {
        Self {
            client,
            addr,
            server_name,
            timeout,
        }
    }

    /// Build from configuration, loading the client identity if present
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let identity = Identity::load_optional(&config.tls.cert_file, &config.tls.key_file)?;
        if identity.is_none() {
            tracing::info!(
                "No client certificate at {:?}; connecting without one",
                config.tls.cert_file
            );
        }
        let client = TlsClient::new(&config.tls.trust_mode(), identity)?;

        Ok(Self::new(
            client,
            config.reverse_tunnel_address(),
            config.remote_host.clone(),
            config.connect_timeout,
        ))
    }
}

#[async_trait]
impl Dialer for TlsDialer {
    async fn dial(&self) -> Result<BoxedIo, TransportError> {
        let stream = self
            .client
            .connect(&self.addr, &self.server_name, self.timeout)
            .await?;
        Ok(Box::new(stream))
    }

    fn target(&self) -> String {
        self.addr.clone()
    }
}
