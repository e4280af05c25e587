use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::pod::PodRef;
use crate::pool::ForwardPool;
use crate::session::Session;

static CONN_COUNTER: AtomicUsize = AtomicUsize::new(1);

const MAX_TRIES: usize = 3;

pub trait Duplex: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Duplex for T {}

pub type RemoteStream = Box<dyn Duplex>;

/// Opens a byte stream to a port inside a pod.
pub trait Forwarder: Send + Sync + 'static {
    fn open(&self, pod: &PodRef, port: u16) -> impl Future<Output = Result<RemoteStream>> + Send;
}

impl Forwarder for Client {
    async fn open(&self, pod: &PodRef, port: u16) -> Result<RemoteStream> {
        let api: Api<Pod> = Api::namespaced(self.clone(), &pod.namespace);
        let mut pf = api
            .portforward(&pod.name, &[port])
            .await
            .map_err(|e| Error::tunnel(&pod.name, e))?;

        let stream = pf
            .take_stream(port)
            .ok_or_else(|| Error::tunnel(&pod.name, format!("no stream for remote port {}", port)))?;
        Ok(Box::new(stream))
    }
}

/// Fronts one pod with a local listener registered as a pool backend.
pub struct TunnelSession<F> {
    forwarder: Arc<F>,
    pool: Arc<ForwardPool>,
    remote_port: u16,
    dry_run: bool,
}

impl<F: Forwarder> TunnelSession<F> {
    pub fn new(forwarder: F, pool: Arc<ForwardPool>, remote_port: u16) -> Self {
        Self {
            forwarder: Arc::new(forwarder),
            pool,
            remote_port,
            dry_run: false,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    #[tracing::instrument(skip_all, fields(pod = %pod))]
    async fn forward(&self, cancel: CancellationToken, pod: PodRef) -> Result<()> {
        let bind_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| Error::bind(bind_addr, e))?;
        let backend = listener.local_addr()?;

        let _registration = Registration::new(&self.pool, backend);
        info!(%backend, remote_port = self.remote_port, "tunnel ready");

        let relays = cancel.child_token();
        let conns = TaskTracker::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                accept_res = listener.accept() => {
                    match accept_res {
                        Ok((sock, peer)) => {
                            let conn_id = CONN_COUNTER.fetch_add(1, Ordering::SeqCst);
                            debug!(%peer, conn_id, "accepted connection");

                            let _ = sock.set_nodelay(true);
                            let forwarder = self.forwarder.clone();
                            let pod = pod.clone();
                            let remote_port = self.remote_port;
                            let relays = relays.clone();
                            conns.spawn(async move {
                                if let Err(e) = handle_connection(
                                    forwarder.as_ref(), &pod, remote_port, sock, relays, conn_id,
                                )
                                .await
                                {
                                    warn!(conn_id, pod = %pod.name, "{}", e);
                                }
                            });
                        }
                        Err(e) => {
                            warn!(%backend, "accept error: {} (will retry)", e);
                            time::sleep(time::Duration::from_millis(200)).await;
                        }
                    }
                }
            }
        }

        drop(listener);
        relays.cancel();
        conns.close();
        conns.wait().await;
        info!(%backend, "tunnel closed");
        Ok(())
    }
}

impl<F: Forwarder> Session for TunnelSession<F> {
    fn accepts(&self, _pod: &PodRef) -> bool {
        true
    }

    async fn run(&self, cancel: CancellationToken, pod: PodRef) -> Result<()> {
        if self.dry_run {
            info!(pod = %pod, remote_port = self.remote_port, "Found!");
            return Ok(());
        }
        self.forward(cancel, pod).await
    }
}

/// Keeps a backend in the pool for as long as it is alive.
struct Registration<'a> {
    pool: &'a ForwardPool,
    backend: SocketAddr,
}

impl<'a> Registration<'a> {
    fn new(pool: &'a ForwardPool, backend: SocketAddr) -> Self {
        pool.add(backend);
        Self { pool, backend }
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.pool.remove(self.backend);
    }
}

/// Relay one local connection over a fresh remote stream.
///
/// Errors only when no remote stream opens within `MAX_TRIES`. Either way
/// the failure is confined to this connection.
async fn handle_connection<F: Forwarder>(
    forwarder: &F,
    pod: &PodRef,
    remote_port: u16,
    mut local_sock: TcpStream,
    cancel: CancellationToken,
    conn_id: usize,
) -> Result<()> {
    let mut attempt = 0usize;
    let mut last_err = None;

    while attempt < MAX_TRIES {
        attempt += 1;
        let opened = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            opened = forwarder.open(pod, remote_port) => opened,
        };

        match opened {
            Ok(mut remote) => {
                debug!(conn_id, pod = %pod.name, "port-forward stream established");
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(conn_id, "force-closing relay");
                    }
                    res = proxy_bidirectional(&mut local_sock, &mut remote) => {
                        if let Err(e) = res {
                            debug!(conn_id, "relay ended: {}", e);
                        }
                    }
                }
                return Ok(());
            }
            Err(e) => last_err = Some(e),
        }

        if attempt < MAX_TRIES {
            let backoff = 50u64 * (1 << (attempt - 1));
            debug!(conn_id, attempt, backoff, "retrying port-forward");
            time::sleep(time::Duration::from_millis(backoff)).await;
        }
    }

    Err(last_err.unwrap_or_else(|| Error::tunnel(&pod.name, "unknown port-forward error")))
}

async fn proxy_bidirectional(local: &mut TcpStream, remote: &mut RemoteStream) -> io::Result<()> {
    io::copy_bidirectional(local, remote).await?;
    let _ = local.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pod::{EventKind, PodEvent, PodPhase};
    use crate::reconciler::Reconciler;
    use futures::channel::mpsc as events;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    /// Answers with the first byte of the pod name, then echoes.
    fn echo_stream(pod: &PodRef) -> RemoteStream {
        let (ours, mut theirs) = io::duplex(1024);
        let tag = pod.name.as_bytes()[0];
        tokio::spawn(async move {
            if theirs.write_all(&[tag]).await.is_err() {
                return;
            }
            let (mut r, mut w) = io::split(theirs);
            let _ = io::copy(&mut r, &mut w).await;
        });
        Box::new(ours)
    }

    #[derive(Default)]
    struct Loopback {
        opened: AtomicUsize,
    }

    impl Forwarder for Arc<Loopback> {
        async fn open(&self, pod: &PodRef, _port: u16) -> Result<RemoteStream> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(echo_stream(pod))
        }
    }

    /// Opens `healthy` streams, then refuses every further attempt.
    struct Flaky {
        healthy: AtomicUsize,
        attempts: AtomicUsize,
    }

    impl Flaky {
        fn new(healthy: usize) -> Self {
            Self {
                healthy: AtomicUsize::new(healthy),
                attempts: AtomicUsize::new(0),
            }
        }
    }

    impl Forwarder for Arc<Flaky> {
        async fn open(&self, pod: &PodRef, _port: u16) -> Result<RemoteStream> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let granted = self
                .healthy
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if granted {
                Ok(echo_stream(pod))
            } else {
                Err(Error::tunnel(&pod.name, "connection refused"))
            }
        }
    }

    fn pod(uid: &str, name: &str) -> PodRef {
        PodRef::new(uid, name, "default", PodPhase::Running)
    }

    async fn wait_for<P: Fn() -> bool>(pred: P) {
        time::timeout(Duration::from_secs(5), async {
            while !pred() {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition reached");
    }

    async fn first_byte(addr: SocketAddr) -> (TcpStream, u8) {
        let mut conn = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        time::timeout(Duration::from_secs(5), conn.read_exact(&mut buf))
            .await
            .expect("tunnel answered")
            .unwrap();
        (conn, buf[0])
    }

    #[tokio::test]
    async fn test_backend_registered_while_running() {
        let pool = Arc::new(ForwardPool::new());
        let forwarder = Arc::new(Loopback::default());
        let session = Arc::new(TunnelSession::new(forwarder.clone(), pool.clone(), 8080));

        let cancel = CancellationToken::new();
        let task = {
            let session = session.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { session.run(cancel, pod("u1", "api-0")).await })
        };

        wait_for(|| pool.backends().len() == 1).await;
        let backend = pool.backends()[0];
        let (mut conn, tag) = first_byte(backend).await;
        assert_eq!(tag, b'a');

        conn.write_all(b"ping").await.unwrap();
        let mut echo = [0u8; 4];
        conn.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"ping");

        cancel.cancel();
        time::timeout(Duration::from_secs(5), task)
            .await
            .expect("run returns after cancel")
            .unwrap()
            .unwrap();
        assert!(pool.backends().is_empty());
        assert_eq!(forwarder.opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_connection_leaves_tunnel_serving() {
        let pool = Arc::new(ForwardPool::new());
        let forwarder = Arc::new(Flaky::new(1));
        let session = Arc::new(TunnelSession::new(forwarder.clone(), pool.clone(), 8080));

        let cancel = CancellationToken::new();
        let task = {
            let session = session.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { session.run(cancel, pod("u1", "api-0")).await })
        };

        wait_for(|| pool.backends().len() == 1).await;
        let backend = pool.backends()[0];
        let (mut held, tag) = first_byte(backend).await;
        assert_eq!(tag, b'a');

        let mut refused = TcpStream::connect(backend).await.unwrap();
        let mut buf = [0u8; 1];
        let read = time::timeout(Duration::from_secs(5), refused.read(&mut buf))
            .await
            .expect("failed connection was closed");
        assert!(matches!(read, Ok(0) | Err(_)));
        wait_for(|| forwarder.attempts.load(Ordering::SeqCst) == 1 + MAX_TRIES).await;

        assert!(!task.is_finished());
        assert_eq!(pool.backends(), vec![backend]);

        held.write_all(b"ping").await.unwrap();
        let mut echo = [0u8; 4];
        time::timeout(Duration::from_secs(5), held.read_exact(&mut echo))
            .await
            .expect("established relay still alive")
            .unwrap();
        assert_eq!(&echo, b"ping");

        cancel.cancel();
        time::timeout(Duration::from_secs(5), task)
            .await
            .expect("run returns after cancel")
            .unwrap()
            .unwrap();
        assert!(pool.backends().is_empty());
    }

    #[tokio::test]
    async fn test_one_shot_never_touches_pool() {
        let pool = Arc::new(ForwardPool::new());
        let forwarder = Arc::new(Loopback::default());
        let session = TunnelSession::new(forwarder.clone(), pool.clone(), 8080);

        let mut done = pod("u1", "job-0");
        done.phase = PodPhase::Succeeded;
        session.run_once(done).await.unwrap();

        assert!(pool.backends().is_empty());
        assert_eq!(forwarder.opened.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dry_run_does_not_listen() {
        let pool = Arc::new(ForwardPool::new());
        let session = TunnelSession::new(Arc::new(Loopback::default()), pool.clone(), 8080).dry_run(true);

        session.run(CancellationToken::new(), pod("u1", "api-0")).await.unwrap();
        assert!(pool.backends().is_empty());
    }

    #[tokio::test]
    async fn test_fixed_port_follows_replacement_pod() {
        let pool = Arc::new(ForwardPool::new());
        let listener = ForwardPool::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let root = CancellationToken::new();
        let serving = {
            let pool = pool.clone();
            let root = root.clone();
            tokio::spawn(async move { pool.serve(listener, root).await })
        };

        let session = Arc::new(TunnelSession::new(Arc::new(Loopback::default()), pool.clone(), 8080));
        let (tx, rx) = events::unbounded();
        let reconciling = tokio::spawn(Reconciler::new("kind", session, &root).reconcile(rx));

        tx.unbounded_send(PodEvent::new(EventKind::Added, pod("u1", "alpha-0"))).unwrap();
        wait_for(|| pool.backends().len() == 1).await;
        let alpha = pool.backends()[0];
        let (mut held, tag) = first_byte(addr).await;
        assert_eq!(tag, b'a');

        tx.unbounded_send(PodEvent::new(EventKind::Deleted, pod("u1", "alpha-0"))).unwrap();
        tx.unbounded_send(PodEvent::new(EventKind::Added, pod("u2", "beta-0"))).unwrap();
        wait_for(|| {
            let backends = pool.backends();
            backends.len() == 1 && backends[0] != alpha
        })
        .await;

        let mut buf = [0u8; 1];
        let read = time::timeout(Duration::from_secs(5), held.read(&mut buf))
            .await
            .expect("relay to the deleted pod was closed");
        assert!(matches!(read, Ok(0) | Err(_)));

        for _ in 0..3 {
            assert_eq!(first_byte(addr).await.1, b'b');
        }

        root.cancel();
        time::timeout(Duration::from_secs(5), async {
            reconciling.await.unwrap();
            serving.await.unwrap();
        })
        .await
        .expect("everything shut down");
        assert!(pool.backends().is_empty());
        time::timeout(Duration::from_secs(1), pool.done())
            .await
            .expect("pool done");
    }
}
