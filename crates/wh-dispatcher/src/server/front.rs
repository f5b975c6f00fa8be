//! Front listener: one stream per client connection

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::dispatcher::Dispatcher;

impl Dispatcher {
    pub(crate) async fn run_front_listener(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.accepting.cancelled() => {
                    tracing::info!("Front listener stopped");
                    break;
                }

                result = listener.accept() => match result {
                    Ok((tcp, peer)) => {
                        let _ = tcp.set_nodelay(true);
                        self.tasks.spawn(Arc::clone(&self).relay_client(tcp, peer));
                    }
                    Err(e) => {
                        tracing::error!("Failed to accept client connection: {}", e);
                    }
                }
            }
        }
    }

    /// Copy bytes between a client socket and a fresh stream.
    ///
    /// Both directions progress independently: a client read waits for
    /// window credit without stopping replies from reaching the client. The
    /// whole relay is bounded by the stream deadline, including writes to a
    /// client that stopped reading.
    async fn relay_client(self: Arc<Self>, tcp: TcpStream, peer: SocketAddr) {
        let mut stream = match self.open_stream(self.settings.stream_timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(%peer, error = %e, "No stream for client");
                return;
            }
        };
        tracing::debug!(%peer, stream = %stream.id(), "Relaying client");

        let (mut reader, mut writer) = tcp.into_split();
        let mut buf = vec![0u8; self.limits.max_frame_size.max(1)];
        let mut client_open = true;
        let mut pending: Option<Bytes> = None;
        let credit = stream.credit();
        let deadline = stream.deadline();

        let relay = async {
            loop {
                tokio::select! {
                    biased;
                    chunk = stream.recv() => match chunk {
                        Ok(Some(data)) => {
                            if writer.write_all(&data).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => {
                            let _ = stream.finish().await;
                            let _ = writer.shutdown().await;
                            break;
                        }
                        Err(e) => {
                            tracing::debug!(%peer, error = %e, "Stream failed");
                            break;
                        }
                    },

                    permit = credit.acquire(), if pending.is_some() => match permit {
                        Ok(permit) => {
                            permit.forget();
                            if let Some(data) = pending.take() {
                                if stream.push(data).await.is_err() {
                                    break;
                                }
                            }
                        }
                        // Stream torn down; the recv arm reports why
                        Err(_) => {
                            pending = None;
                            client_open = false;
                        }
                    },

                    read = reader.read(&mut buf), if client_open && pending.is_none() => match read {
                        Ok(0) => {
                            client_open = false;
                            if stream.finish().await.is_err() {
                                break;
                            }
                        }
                        Ok(n) => pending = Some(Bytes::copy_from_slice(&buf[..n])),
                        Err(e) => {
                            tracing::debug!(%peer, error = %e, "Client read failed");
                            break;
                        }
                    },
                }
            }
        };

        if tokio::time::timeout_at(deadline, relay).await.is_err() {
            tracing::debug!(%peer, "Client relay outlived the stream deadline");
        }
    }
}
