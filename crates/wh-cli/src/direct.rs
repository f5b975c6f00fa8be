//! Direct-serve mode
//!
//! Terminates TLS on the tunnel port and proxies every connection straight
//! to the local service. No cluster, no dispatcher.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use wh_core::tls::{Identity, TlsServer};
use wh_core::{Config, WhError};

/// A running direct-serve listener
pub struct DirectServer {
    addr: SocketAddr,
    accepting: CancellationToken,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl DirectServer {
    /// Load the server identity, bind the tunnel port and start serving
    pub async fn bind(config: &Config) -> Result<Self, WhError> {
        let identity = Identity::load(&config.tls.cert_file, &config.tls.key_file)?;
        let tls = TlsServer::new(identity, config.tls.trust_ca_file.as_deref())?;

        let listener = TcpListener::bind(config.tunnel_bind()).await?;
        let addr = listener.local_addr()?;
        tracing::info!("Direct-serve listening on {}, forwarding to {}", addr, config.local_addr);

        let server = Self {
            addr,
            accepting: CancellationToken::new(),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        };
        server.tasks.spawn(accept_loop(
            listener,
            tls,
            config.local_addr.clone(),
            config.connect_timeout,
            server.accepting.clone(),
            server.cancel.clone(),
            server.tasks.clone(),
        ));
        Ok(server)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn stop_accepting(&self) {
        self.accepting.cancel();
    }

    /// Drop every proxied connection
    pub fn abort(&self) {
        self.accepting.cancel();
        self.cancel.cancel();
    }

    /// Wait for the listener and all connections to finish
    pub async fn wait(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }
}

async fn accept_loop(
    listener: TcpListener,
    tls: TlsServer,
    local_addr: String,
    timeout: Duration,
    accepting: CancellationToken,
    cancel: CancellationToken,
    tasks: TaskTracker,
) {
    loop {
        let (tcp, peer) = tokio::select! {
            _ = accepting.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::error!("Failed to accept connection: {}", e);
                    continue;
                }
            },
        };

        let tls = tls.clone();
        let local_addr = local_addr.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = proxy(tcp, tls, &local_addr, timeout) => {
                    if let Err(e) = result {
                        tracing::debug!(%peer, error = %e, "Direct connection failed");
                    }
                }
            }
        });
    }
    tracing::info!("Direct-serve listener stopped");
}

async fn proxy(tcp: TcpStream, tls: TlsServer, local_addr: &str, timeout: Duration) -> Result<(), WhError> {
    let mut client = tls.accept(tcp, timeout).await?;
    let mut local = tokio::time::timeout(timeout, TcpStream::connect(local_addr))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "local connect timed out"))??;
    tokio::io::copy_bidirectional(&mut client, &mut local).await?;
    Ok(())
}
