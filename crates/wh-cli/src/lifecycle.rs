//! Ordered shutdown
//!
//! Components are stopped in a fixed order so that no traffic is lost
//! while leadership and transport are still usable:
//!
//! 1. The dispatcher (or direct-serve listener) stops accepting.
//! 2. The tunnel client refuses new streams and drains in-flight ones.
//!    Past the deadline remaining streams are cancelled.
//! 3. The cluster node broadcasts Leave.
//! 4. Listeners, sessions and sockets are released.
//!
//! [`Lifecycle::kill`] skips all of that: tasks are aborted, no GoAway is
//! sent and the cluster hears nothing, exactly what peers see when the
//! process dies.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use wh_cluster::ClusterNode;
use wh_connector::TunnelClient;
use wh_dispatcher::Dispatcher;

use crate::direct::DirectServer;

/// Bound on releasing resources after the grace deadline
const RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll interval while waiting for dispatcher streams to finish
const DRAIN_POLL: Duration = Duration::from_millis(50);

/// Everything a running node owns, stopped in order by [`Lifecycle::shutdown`]
#[derive(Default)]
pub struct Lifecycle {
    dispatcher: Option<Arc<Dispatcher>>,
    tunnel: Option<(Arc<TunnelClient>, JoinHandle<()>)>,
    direct: Option<DirectServer>,
    cluster: Option<ClusterNode>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn with_tunnel(mut self, client: Arc<TunnelClient>, task: JoinHandle<()>) -> Self {
        self.tunnel = Some((client, task));
        self
    }

    pub fn with_direct(mut self, direct: DirectServer) -> Self {
        self.direct = Some(direct);
        self
    }

    pub fn with_cluster(mut self, cluster: ClusterNode) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// Run the shutdown sequence; `grace` bounds phases 1 and 2
    pub async fn shutdown(self, grace: Duration) -> Result<()> {
        let deadline = Instant::now() + grace;
        tracing::info!("Shutting down (grace {:?})", grace);

        // Phase 1
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.stop_accepting();
        }
        if let Some(direct) = &self.direct {
            direct.stop_accepting();
        }

        // Phase 2
        if let Some((client, mut task)) = self.tunnel {
            client.stop_accepting();
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                tracing::warn!("Tunnel did not drain in time, cancelling remaining streams");
                client.abort();
                if tokio::time::timeout(RELEASE_TIMEOUT, &mut task).await.is_err() {
                    task.abort();
                }
            }
        }
        if let Some(direct) = &self.direct {
            if tokio::time::timeout_at(deadline, direct.wait()).await.is_err() {
                tracing::warn!("Direct connections still open at deadline, dropping them");
                direct.abort();
            }
        }
        if let Some(dispatcher) = &self.dispatcher {
            let drained = tokio::time::timeout_at(deadline, async {
                while dispatcher.sessions().list().iter().any(|s| s.open_streams() > 0) {
                    tokio::time::sleep(DRAIN_POLL).await;
                }
            })
            .await;
            if drained.is_err() {
                tracing::warn!("Streams still open at deadline, cancelling them");
            }
            dispatcher.close_all("dispatcher shutting down");
        }

        // Phase 3
        if let Some(cluster) = &self.cluster {
            cluster.leave().await;
        }

        // Phase 4
        if let Some(dispatcher) = &self.dispatcher {
            if tokio::time::timeout(RELEASE_TIMEOUT, dispatcher.wait()).await.is_err() {
                tracing::warn!("Dispatcher tasks did not finish in time");
            }
        }
        if let Some(direct) = &self.direct {
            if tokio::time::timeout(RELEASE_TIMEOUT, direct.wait()).await.is_err() {
                tracing::warn!("Direct-serve tasks did not finish in time");
            }
        }
        if let Some(cluster) = self.cluster {
            cluster
                .shutdown()
                .await
                .context("Cluster node stopped with an error")?;
        }

        tracing::info!("Shutdown complete");
        Ok(())
    }

    /// Stop at once without draining, GoAway or Leave
    pub async fn kill(self) {
        tracing::warn!("Killing node without draining");

        // Before the cluster: losing leadership would start a graceful drain.
        if let Some((_, task)) = self.tunnel {
            task.abort();
            let _ = task.await;
        }
        if let Some(direct) = &self.direct {
            direct.stop_accepting();
            direct.abort();
        }
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.close_all("dispatcher killed");
        }
        if let Some(cluster) = self.cluster {
            if let Err(e) = cluster.shutdown().await {
                tracing::warn!("Cluster node stopped with an error: {}", e);
            }
        }
    }
}
