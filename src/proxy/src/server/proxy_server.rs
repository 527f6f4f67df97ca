use crate::backend::monitor::{
    RoleFlags, ServerDescriptor, ServerSnapshot, SnapshotPublisher,
};
use crate::config::{ConfigPublisher, ProxyConfig};
use crate::server::admin::AdminController;
use crate::server::worker::{WorkerPool, WorkerTlsConfig};

use common::ShutdownMessage;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch::Receiver;
use tracing::{info, warn};

/// The assembled proxy: snapshot publishers, the worker pool, and the
/// accept loop. Construction wires the admin controller to the same
/// publishers so runtime verbs swap the snapshots the workers read.
pub struct SplitProxyServer {
    workers: Arc<WorkerPool>,
}

impl SplitProxyServer {
    pub fn new(config: ProxyConfig, tls: WorkerTlsConfig) -> (Self, AdminController) {
        let initial_snapshot = static_snapshot(&config);
        let pool_cap = config
            .services
            .first()
            .map(|s| s.limits.pool_cap)
            .unwrap_or(crate::backend::pool::DEFAULT_POOL_CAP);
        let workers_n = config.workers;

        let (config_publisher, config_rx) = ConfigPublisher::new(config);
        let (snapshot_publisher, snapshot_rx) = SnapshotPublisher::new(initial_snapshot);

        let workers = Arc::new(WorkerPool::spawn(
            workers_n,
            snapshot_rx,
            config_rx,
            pool_cap,
            tls,
        ));
        let admin = AdminController::new(
            snapshot_publisher,
            config_publisher,
            Arc::clone(&workers),
        );
        (Self { workers }, admin)
    }

    pub fn workers(&self) -> &Arc<WorkerPool> {
        &self.workers
    }

    /// Accept loop: hand each connection to a worker by round-robin. Errors
    /// on a single accept never take the listener down.
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown_rx: Receiver<ShutdownMessage>,
    ) -> std::io::Result<()> {
        info!("listening on {:?}", listener.local_addr()?);
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_ok() {
                        if let ShutdownMessage::Cancel(msg) = shutdown_rx.borrow_and_update().clone() {
                            info!("listener stopping: {msg}");
                        }
                    }
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            self.workers.dispatch(stream, peer);
                        }
                        Err(e) => {
                            warn!("accept failed: {e}");
                        }
                    }
                }
            }
        }
    }
}

/// Build the startup snapshot from the static server list: the first server
/// acts as master until the monitor publishes real roles.
fn static_snapshot(config: &ProxyConfig) -> ServerSnapshot {
    let servers = config
        .servers
        .iter()
        .enumerate()
        .map(|(idx, entry)| {
            let role = if idx == 0 {
                RoleFlags::MASTER
            } else {
                RoleFlags::SLAVE
            };
            ServerDescriptor {
                name: entry.name.clone(),
                addr: entry.address.clone(),
                port: entry.port,
                roles: role | RoleFlags::RUNNING,
                status_version: 0,
                rank: entry.rank,
                lag_secs: None,
                connections: 0,
            }
        })
        .collect();
    ServerSnapshot {
        version: 0,
        servers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerEntry;

    #[test]
    fn static_snapshot_roles() {
        let config = ProxyConfig {
            servers: vec![
                ServerEntry {
                    name: "s1".into(),
                    address: "127.0.0.1".into(),
                    port: 3306,
                    tls: false,
                    rank: 1,
                    initial_pool_size: 0,
                    proxy_protocol: None,
                    connection_init_queries: Vec::new(),
                },
                ServerEntry {
                    name: "s2".into(),
                    address: "127.0.0.1".into(),
                    port: 3307,
                    tls: false,
                    rank: 1,
                    initial_pool_size: 0,
                    proxy_protocol: None,
                    connection_init_queries: Vec::new(),
                },
            ],
            ..Default::default()
        };
        let snap = static_snapshot(&config);
        assert_eq!(snap.master().unwrap().name, "s1");
        assert_eq!(snap.usable_slaves().count(), 1);
    }
}
