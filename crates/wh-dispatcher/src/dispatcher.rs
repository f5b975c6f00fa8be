//! The dispatcher facade
//!
//! Owns the session manager and the admission policy, serves tunnel
//! connections, and opens streams for external callers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use wh_core::config::DispatcherConfig;
use wh_core::tls::TlsServer;
use wh_core::{Config, DispatchError, WhError};

use crate::authority::{LeadershipAuthority, TermFence};
use crate::session::{SessionEvent, SessionLimits, SessionManager, Stream};

/// Largest response [`Dispatcher::request`] collects
pub const MAX_RESPONSE_SIZE: usize = 16 * 1024 * 1024;

/// Central side of the reverse tunnel
pub struct Dispatcher {
    pub(crate) settings: DispatcherConfig,
    pub(crate) limits: SessionLimits,
    pub(crate) manager: Arc<SessionManager>,
    pub(crate) authority: Arc<dyn LeadershipAuthority>,
    /// Cancelled when listeners must stop accepting
    pub(crate) accepting: CancellationToken,
    /// Cancelled when the dispatcher is shutting down
    pub(crate) shutdown: CancellationToken,
    pub(crate) tasks: TaskTracker,
}

impl Dispatcher {
    /// Create a dispatcher admitting registrations through `authority`
    pub fn new(config: &Config, authority: Arc<dyn LeadershipAuthority>) -> Arc<Self> {
        Arc::new(Self {
            settings: config.dispatcher.clone(),
            limits: SessionLimits {
                max_streams: config.dispatcher.max_streams_per_session,
                max_frame_size: config.tunnel.max_frame_size,
                stream_buffer: config.tunnel.stream_buffer,
            },
            manager: Arc::new(SessionManager::new()),
            authority,
            accepting: CancellationToken::new(),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    /// Create a dispatcher fencing registrations by term
    pub fn with_term_fence(config: &Config) -> Arc<Self> {
        Self::new(config, Arc::new(TermFence::new()))
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// Subscribe to session open/close events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.manager.subscribe()
    }

    /// Open a stream on the owning session.
    ///
    /// Waits up to `owner_wait_timeout` for an owner and up to
    /// `stream_acquire_timeout` for a free slot.
    pub async fn open_stream(&self, deadline: Duration) -> Result<Stream, DispatchError> {
        let shutting_down = || DispatchError::Cancelled("dispatcher shutting down".into());
        if self.shutdown.is_cancelled() {
            return Err(shutting_down());
        }

        let session = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(shutting_down()),
            owner = self.manager.wait_owner(self.settings.owner_wait_timeout) => owner?,
        };
        let permit = session.acquire(self.settings.stream_acquire_timeout).await?;
        session.open_stream(permit, deadline).await
    }

    /// Send `payload` on a new stream and collect the whole response
    pub async fn request(&self, payload: &[u8], deadline: Duration) -> Result<Bytes, DispatchError> {
        let mut stream = self.open_stream(deadline).await?;
        stream.exchange(payload, MAX_RESPONSE_SIZE).await
    }

    /// Bind the reverse-tunnel listener and start accepting connectors
    pub async fn bind_tunnel(self: &Arc<Self>, addr: &str, tls: TlsServer) -> Result<SocketAddr, WhError> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        tracing::info!("Reverse tunnel listening on {}", local);

        self.tasks
            .spawn(Arc::clone(self).run_tunnel_listener(listener, tls));
        Ok(local)
    }

    /// Bind the front listener; every client connection becomes one stream
    pub async fn bind_front(self: &Arc<Self>, addr: &str) -> Result<SocketAddr, WhError> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        tracing::info!("Front listener on {}", local);

        self.tasks.spawn(Arc::clone(self).run_front_listener(listener));
        Ok(local)
    }

    /// Stop accepting new connections. Established sessions keep running.
    pub fn stop_accepting(&self) {
        if !self.accepting.is_cancelled() {
            tracing::info!("Dispatcher no longer accepting connections");
            self.accepting.cancel();
        }
    }

    /// Close every session; open streams fail with `Cancelled`
    pub fn close_all(&self, reason: &str) {
        self.accepting.cancel();
        self.shutdown.cancel();
        self.manager.close_all(reason);
    }

    /// Wait for listener and connection tasks to finish
    pub async fn wait(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }
}
