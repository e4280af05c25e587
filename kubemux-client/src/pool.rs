//! A fixed local port in front of a changing set of tunnel backends.

use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io;
use tokio::net::{TcpListener, TcpStream};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Relays every connection accepted on one listener to a backend picked
/// round-robin from the live set.
///
/// A connection keeps the backend it was given even if that backend is
/// removed later; removal only affects connections accepted afterwards.
#[derive(Default)]
pub struct ForwardPool {
    backends: RwLock<Vec<SocketAddr>>,
    next: AtomicUsize,
    conn_counter: AtomicUsize,
    relays: TaskTracker,
    stopped: CancellationToken,
}

impl ForwardPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
        TcpListener::bind(addr)
            .await
            .map_err(|e| Error::bind(addr, e))
    }

    /// Bind `addr` and relay connections until `cancel` fires.
    pub async fn start(&self, cancel: CancellationToken, addr: SocketAddr) -> Result<()> {
        let listener = match Self::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.stopped.cancel();
                return Err(e);
            }
        };

        self.serve(listener, cancel).await;
        Ok(())
    }

    /// Accept on `listener` until `cancel` fires, then force-close live
    /// relays and wait for them.
    #[tracing::instrument(skip_all)]
    pub async fn serve(&self, listener: TcpListener, cancel: CancellationToken) {
        let local = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        info!("Forwarding pool listening on {}", local);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Forwarding pool on {} canceled; closing listener", local);
                    break;
                }

                accept_res = listener.accept() => {
                    match accept_res {
                        Ok((sock, peer)) => {
                            let conn_id = self.conn_counter.fetch_add(1, Ordering::SeqCst);
                            let Some(backend) = self.pick() else {
                                warn!(%peer, conn_id, "no backend available, closing connection");
                                drop(sock);
                                continue;
                            };
                            debug!(%peer, %backend, conn_id, "accepted connection");

                            let _ = sock.set_nodelay(true);
                            let cancel = cancel.clone();
                            self.relays.spawn(async move {
                                if let Err(e) = relay(sock, backend, cancel).await {
                                    warn!(conn_id, %backend, "relay ended with error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            warn!("accept error on {}: {} (will retry)", local, e);
                            time::sleep(time::Duration::from_millis(200)).await;
                        }
                    }
                }
            }
        }

        drop(listener);
        self.relays.close();
        self.relays.wait().await;
        self.stopped.cancel();
        info!("Forwarding pool on {} stopped", local);
    }

    /// Returns `false` if `backend` was already registered.
    pub fn add(&self, backend: SocketAddr) -> bool {
        let mut backends = self.backends.write();
        if backends.contains(&backend) {
            return false;
        }
        backends.push(backend);
        true
    }

    /// Returns `false` if `backend` was not registered.
    pub fn remove(&self, backend: SocketAddr) -> bool {
        let mut backends = self.backends.write();
        match backends.iter().position(|b| *b == backend) {
            Some(idx) => {
                backends.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn backends(&self) -> Vec<SocketAddr> {
        self.backends.read().clone()
    }

    /// Resolves once the pool stopped accepting and every relay is gone.
    pub async fn done(&self) {
        self.stopped.cancelled().await
    }

    fn pick(&self) -> Option<SocketAddr> {
        let backends = self.backends.read();
        if backends.is_empty() {
            return None;
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % backends.len();
        Some(backends[idx])
    }
}

async fn relay(mut inbound: TcpStream, backend: SocketAddr, cancel: CancellationToken) -> io::Result<()> {
    let mut outbound = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        conn = TcpStream::connect(backend) => conn?,
    };
    let _ = outbound.set_nodelay(true);

    tokio::select! {
        _ = cancel.cancelled() => {
            debug!(%backend, "force-closing relay");
        }
        res = io::copy_bidirectional(&mut inbound, &mut outbound) => {
            res?;
        }
    }

    Ok(())
}
