use crate::backend::conn::BackendConn;
use crate::backend::monitor::SnapshotReader;
use crate::backend::pool::ConnPool;
use crate::classifier::{set_worker_classify_context, ClassifyContext};
use crate::config::ConfigReader;
use crate::server::client_conn::ClientConn;

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::LocalSet;
use tracing::{debug, info, warn};

const POOL_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const POOLED_MAX_IDLE_SECS: u64 = 3600;

/// Cross-worker messages. Everything a worker does on behalf of another
/// thread arrives through this queue; no session state is shared.
pub enum WorkerTask {
    /// Adopt an accepted client socket; the session lives on this worker
    /// until teardown. Carried as a std socket so the worker registers it
    /// with its own reactor.
    AdoptStream {
        stream: std::net::TcpStream,
        peer: SocketAddr,
    },
    /// Drop pooled connections to a server (status change, admin verb).
    /// Acknowledged so admin verbs are synchronous for the caller.
    FlushServerPool {
        server: String,
        ack: oneshot::Sender<()>,
    },
    /// Acknowledge that this worker has observed the latest snapshots.
    Barrier { ack: oneshot::Sender<()> },
    Shutdown,
}

/// Listener TLS material handed to every worker; empty when the listener
/// runs in plaintext.
#[derive(Clone, Default)]
pub struct WorkerTlsConfig {
    #[cfg(feature = "tls")]
    pub acceptor: Option<tokio_rustls::TlsAcceptor>,
}

/// State shared between the sessions pinned to one worker thread. `Rc`
/// because everything here is single-threaded by construction.
pub struct WorkerContext {
    pub worker_id: usize,
    pub pool: RefCell<ConnPool<BackendConn>>,
    pub snapshot: RefCell<SnapshotReader>,
    pub config: RefCell<ConfigReader>,
    #[cfg(feature = "tls")]
    pub tls_acceptor: Option<tokio_rustls::TlsAcceptor>,
}

pub struct WorkerHandle {
    tx: mpsc::UnboundedSender<WorkerTask>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn send(&self, task: WorkerTask) {
        if self.tx.send(task).is_err() {
            warn!("worker queue closed; task dropped");
        }
    }
}

/// Fixed set of worker threads, each running an independent event loop on a
/// current-thread runtime. The listener hands accepted sockets over by
/// round-robin.
pub struct WorkerPool {
    workers: Vec<WorkerHandle>,
    next: AtomicUsize,
}

impl WorkerPool {
    pub fn spawn(
        count: usize,
        snapshot: SnapshotReader,
        config: ConfigReader,
        pool_cap: usize,
        tls: WorkerTlsConfig,
    ) -> Self {
        let workers = (0..count)
            .map(|worker_id| {
                let snapshot = snapshot.clone();
                let config = config.clone();
                let tls = tls.clone();
                let (tx, rx) = mpsc::unbounded_channel();
                let join = thread::Builder::new()
                    .name(format!("rws-worker-{worker_id}"))
                    .spawn(move || worker_main(worker_id, rx, snapshot, config, pool_cap, tls))
                    .expect("failed to spawn worker thread");
                WorkerHandle {
                    tx,
                    join: Some(join),
                }
            })
            .collect();
        Self {
            workers,
            next: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Round-robin adoption of a freshly accepted client socket.
    pub fn dispatch(&self, stream: TcpStream, peer: SocketAddr) {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        match stream.into_std() {
            Ok(stream) => {
                self.workers[idx].send(WorkerTask::AdoptStream { stream, peer });
            }
            Err(e) => warn!("failed to detach accepted socket: {e}"),
        }
    }

    /// Post a task to every worker and collect the acknowledgements.
    pub async fn broadcast_flush(&self, server: &str) {
        let mut acks = Vec::with_capacity(self.workers.len());
        for w in &self.workers {
            let (ack, rx) = oneshot::channel();
            w.send(WorkerTask::FlushServerPool {
                server: server.to_string(),
                ack,
            });
            acks.push(rx);
        }
        for rx in acks {
            let _ = rx.await;
        }
    }

    /// Wait until every worker has drained its queue up to this point,
    /// i.e. observed any snapshot published before the call.
    pub async fn barrier(&self) {
        let mut acks = Vec::with_capacity(self.workers.len());
        for w in &self.workers {
            let (ack, rx) = oneshot::channel();
            w.send(WorkerTask::Barrier { ack });
            acks.push(rx);
        }
        for rx in acks {
            let _ = rx.await;
        }
    }

    pub fn shutdown(&mut self) {
        for w in &self.workers {
            w.send(WorkerTask::Shutdown);
        }
        for w in &mut self.workers {
            if let Some(join) = w.join.take() {
                let _ = join.join();
            }
        }
    }
}

fn worker_main(
    worker_id: usize,
    mut rx: mpsc::UnboundedReceiver<WorkerTask>,
    snapshot: SnapshotReader,
    config: ConfigReader,
    pool_cap: usize,
    tls: WorkerTlsConfig,
) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build worker runtime");
    // worker-local classifier context, set once at startup
    set_worker_classify_context(ClassifyContext::default());

    #[cfg(not(feature = "tls"))]
    let _ = tls;
    let ctx = Rc::new(WorkerContext {
        worker_id,
        pool: RefCell::new(ConnPool::new(pool_cap)),
        snapshot: RefCell::new(snapshot),
        config: RefCell::new(config),
        #[cfg(feature = "tls")]
        tls_acceptor: tls.acceptor,
    });

    let local = LocalSet::new();
    local.block_on(&runtime, async move {
        info!("worker {worker_id} started");
        let mut sweep = tokio::time::interval(POOL_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                task = rx.recv() => {
                    match task {
                        Some(WorkerTask::AdoptStream { stream, peer }) => {
                            debug!("worker {worker_id} adopting connection from {peer}");
                            let stream = match TcpStream::from_std(stream) {
                                Ok(s) => s,
                                Err(e) => {
                                    warn!("failed to adopt socket from {peer}: {e}");
                                    continue;
                                }
                            };
                            let ctx = Rc::clone(&ctx);
                            common::metrics::gauge_inc(
                                common::metrics::metric_def::PROXY_CURR_CONN,
                                1_f64,
                                Some(common::metrics::common_labels()),
                            );
                            tokio::task::spawn_local(async move {
                                if let Err(e) = ClientConn::run(stream, peer, ctx).await {
                                    debug!("session from {peer} ended: {e}");
                                }
                                common::metrics::gauge_dec(
                                    common::metrics::metric_def::PROXY_CURR_CONN,
                                    1_f64,
                                    Some(common::metrics::common_labels()),
                                );
                            });
                        }
                        Some(WorkerTask::FlushServerPool { server, ack }) => {
                            let mut dropped = ctx.pool.borrow_mut().drop_server(&server);
                            for conn in &mut dropped {
                                conn.shutdown().await;
                            }
                            let _ = ack.send(());
                        }
                        Some(WorkerTask::Barrier { ack }) => {
                            // refresh both snapshots at this safe point
                            ctx.snapshot.borrow_mut().borrow_and_update();
                            ctx.config.borrow_mut().borrow_and_update();
                            let _ = ack.send(());
                        }
                        Some(WorkerTask::Shutdown) | None => {
                            info!("worker {worker_id} shutting down");
                            break;
                        }
                    }
                }
                _ = sweep.tick() => {
                    let mut expired = ctx.pool.borrow_mut().expire_idle(POOLED_MAX_IDLE_SECS);
                    for conn in &mut expired {
                        conn.shutdown().await;
                    }
                }
            }
        }
    });
}
