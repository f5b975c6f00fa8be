//! Role wiring
//!
//! [`start`] brings up a connector node (cluster member plus tunnel
//! client, or the direct-serve listener), [`start_dispatcher`] the central
//! dispatcher. Both hand back a [`RunningHandle`] that owns every task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use wh_cluster::{ClusterNode, FileStateStore};
use wh_connector::{TlsDialer, TunnelClient};
use wh_core::tls::{Identity, TlsServer};
use wh_core::{Config, LeadershipSnapshot, TunnelState};
use wh_dispatcher::Dispatcher;

use crate::direct::DirectServer;
use crate::lifecycle::Lifecycle;

/// Addresses the running node actually bound
#[derive(Debug, Clone, Default)]
pub struct BoundAddrs {
    pub gossip: Option<SocketAddr>,
    pub consensus: Option<SocketAddr>,
    pub reverse_tunnel: Option<SocketAddr>,
    pub front: Option<SocketAddr>,
    pub direct: Option<SocketAddr>,
}

/// A started node
pub struct RunningHandle {
    lifecycle: Mutex<Option<Lifecycle>>,
    terminate: CancellationToken,
    addrs: BoundAddrs,
    dispatcher: Option<Arc<Dispatcher>>,
    leadership: Option<watch::Receiver<LeadershipSnapshot>>,
    tunnel: Option<watch::Receiver<TunnelState>>,
}

impl RunningHandle {
    fn new(lifecycle: Lifecycle, addrs: BoundAddrs) -> Self {
        Self {
            lifecycle: Mutex::new(Some(lifecycle)),
            terminate: CancellationToken::new(),
            addrs,
            dispatcher: None,
            leadership: None,
            tunnel: None,
        }
    }

    /// Request termination; whoever waits on [`terminated`](Self::terminated)
    /// is expected to call [`shutdown`](Self::shutdown)
    pub fn trigger(&self) {
        self.terminate.cancel();
    }

    /// Resolves once [`trigger`](Self::trigger) was called or a component
    /// stopped on its own
    pub async fn terminated(&self) {
        self.terminate.cancelled().await
    }

    /// Stop everything in order. Later calls return immediately.
    pub async fn shutdown(&self, grace: Duration) -> Result<()> {
        self.terminate.cancel();
        let lifecycle = self.lifecycle.lock().await.take();
        match lifecycle {
            Some(lifecycle) => lifecycle.shutdown(grace).await,
            None => Ok(()),
        }
    }

    /// Stop without draining or leaving, the way a crashed process would.
    /// Later calls, and [`shutdown`](Self::shutdown) afterwards, do nothing.
    pub async fn kill(&self) {
        self.terminate.cancel();
        let lifecycle = self.lifecycle.lock().await.take();
        if let Some(lifecycle) = lifecycle {
            lifecycle.kill().await;
        }
    }

    pub fn addrs(&self) -> &BoundAddrs {
        &self.addrs
    }

    /// The dispatcher, when this handle runs one
    pub fn dispatcher(&self) -> Option<&Arc<Dispatcher>> {
        self.dispatcher.as_ref()
    }

    /// Leadership snapshots of the local cluster node
    pub fn leadership(&self) -> Option<watch::Receiver<LeadershipSnapshot>> {
        self.leadership.clone()
    }

    /// Tunnel client state transitions
    pub fn tunnel_state(&self) -> Option<watch::Receiver<TunnelState>> {
        self.tunnel.clone()
    }
}

/// Start a connector node
pub async fn start(config: Config) -> Result<RunningHandle> {
    config.validate().context("Invalid configuration")?;

    if config.direct_serve {
        let direct = DirectServer::bind(&config)
            .await
            .context("Failed to start direct-serve listener")?;
        let addrs = BoundAddrs {
            direct: Some(direct.local_addr()),
            ..Default::default()
        };
        return Ok(RunningHandle::new(Lifecycle::new().with_direct(direct), addrs));
    }

    let dialer = TlsDialer::from_config(&config).context("Failed to set up TLS client")?;

    std::fs::create_dir_all(&config.state_dir)
        .with_context(|| format!("Failed to create state dir {}", config.state_dir.display()))?;
    let store = FileStateStore::open(&config.state_dir).context("Failed to open consensus state")?;
    let cluster = ClusterNode::start(&config.cluster, Box::new(store), CancellationToken::new())
        .await
        .context("Failed to start cluster node")?;

    let client = TunnelClient::new(
        cluster.id().clone(),
        &config,
        Arc::new(dialer),
        cluster.leadership(),
    );
    let task = tokio::spawn(client.clone().run());

    let addrs = BoundAddrs {
        gossip: Some(cluster.gossip_addr()),
        consensus: Some(cluster.consensus_addr()),
        ..Default::default()
    };
    let leadership = cluster.leadership();
    let tunnel = client.state();
    let node_stopped = cluster.cancel_token();

    let mut handle = RunningHandle::new(
        Lifecycle::new()
            .with_tunnel(client, task)
            .with_cluster(cluster),
        addrs,
    );
    handle.leadership = Some(leadership);
    handle.tunnel = Some(tunnel);

    let terminate = handle.terminate.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = terminate.cancelled() => {}
            _ = node_stopped.cancelled() => {
                tracing::error!("Cluster node stopped unexpectedly");
                terminate.cancel();
            }
        }
    });

    Ok(handle)
}

/// Start the central dispatcher
pub async fn start_dispatcher(config: Config) -> Result<RunningHandle> {
    config.validate().context("Invalid configuration")?;

    let identity = Identity::load(&config.tls.cert_file, &config.tls.key_file)
        .context("Failed to load dispatcher certificate")?;
    let tls = TlsServer::new(identity, config.tls.trust_ca_file.as_deref())
        .context("Failed to set up TLS server")?;

    let dispatcher = Dispatcher::with_term_fence(&config);
    let reverse_tunnel = dispatcher
        .bind_tunnel(&config.reverse_tunnel_bind(), tls)
        .await
        .context("Failed to bind reverse-tunnel listener")?;
    let front = match dispatcher.bind_front(&config.tunnel_bind()).await {
        Ok(addr) => addr,
        Err(e) => {
            dispatcher.close_all("startup failed");
            return Err(e).context("Failed to bind tunnel listener");
        }
    };

    let addrs = BoundAddrs {
        reverse_tunnel: Some(reverse_tunnel),
        front: Some(front),
        ..Default::default()
    };
    let mut handle = RunningHandle::new(Lifecycle::new().with_dispatcher(dispatcher.clone()), addrs);
    handle.dispatcher = Some(dispatcher);
    Ok(handle)
}
