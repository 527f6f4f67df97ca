use crate::backend::monitor::{RoleFlags, SnapshotPublisher};
use crate::config::{ConfigPublisher, FilterConfig, ServiceConfig};
use crate::server::worker::WorkerPool;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strum_macros::EnumString;
use tokio::sync::watch;
use tracing::info;

/// Server flags an administrator may set or clear at runtime. Role flags
/// (master/slave) stay owned by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerFlagName {
    #[strum(serialize = "maintenance")]
    Maintenance,
    #[strum(serialize = "draining")]
    Draining,
}

impl ServerFlagName {
    fn as_role(self) -> RoleFlags {
        match self {
            ServerFlagName::Maintenance => RoleFlags::MAINTENANCE,
            ServerFlagName::Draining => RoleFlags::DRAINING,
        }
    }
}

/// The imperative administrative verbs. Each is synchronous from the admin
/// client's point of view: the reply is sent only after every worker has
/// observed the change.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "verb", rename_all = "snake_case")]
pub enum AdminVerb {
    ListServers,
    AlterServer {
        name: String,
        rank: Option<i32>,
    },
    SetServerFlag {
        name: String,
        flag: ServerFlagName,
    },
    ClearServerFlag {
        name: String,
        flag: ServerFlagName,
    },
    StopMonitor,
    StartMonitor,
    CreateService(Box<ServiceConfig>),
    DestroyService {
        name: String,
    },
    AlterService(Box<ServiceConfig>),
    CreateFilter(FilterConfig),
    DestroyFilter {
        name: String,
    },
    AlterFilter(FilterConfig),
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerStatusView {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub state: String,
    pub rank: i32,
    pub lag_secs: Option<u64>,
    pub connections: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AdminReply {
    Servers { servers: Vec<ServerStatusView> },
    Done,
    Error { message: String },
}

/// Owns the single-writer ends of the server and config snapshots and turns
/// admin verbs into snapshot swaps plus worker notifications.
pub struct AdminController {
    snapshot: SnapshotPublisher,
    config: ConfigPublisher,
    workers: Arc<WorkerPool>,
    monitor_enabled: watch::Sender<bool>,
}

impl AdminController {
    pub fn new(
        snapshot: SnapshotPublisher,
        config: ConfigPublisher,
        workers: Arc<WorkerPool>,
    ) -> Self {
        let (monitor_enabled, _) = watch::channel(true);
        Self {
            snapshot,
            config,
            workers,
            monitor_enabled,
        }
    }

    /// Receiver for the external monitor task: `false` means probing is
    /// suspended.
    pub fn monitor_control(&self) -> watch::Receiver<bool> {
        self.monitor_enabled.subscribe()
    }

    pub fn snapshot_publisher(&mut self) -> &mut SnapshotPublisher {
        &mut self.snapshot
    }

    pub async fn execute(&mut self, verb: AdminVerb) -> AdminReply {
        info!("admin verb {verb:?}");
        match verb {
            AdminVerb::ListServers => {
                let snap = self.snapshot.current();
                let servers = snap
                    .servers
                    .iter()
                    .map(|s| ServerStatusView {
                        name: s.name.clone(),
                        address: s.addr.clone(),
                        port: s.port,
                        state: format!("{:?}", s.roles),
                        rank: s.rank,
                        lag_secs: s.lag_secs,
                        connections: s.connections,
                    })
                    .collect();
                AdminReply::Servers { servers }
            }
            AdminVerb::AlterServer { name, rank } => {
                let mut snap = self.snapshot.current().as_ref().clone();
                let Some(server) = snap.servers.iter_mut().find(|s| s.name == name) else {
                    return AdminReply::Error {
                        message: format!("no server named {name:?}"),
                    };
                };
                if let Some(rank) = rank {
                    server.rank = rank;
                    server.status_version += 1;
                }
                self.snapshot.publish(snap);
                self.workers.barrier().await;
                AdminReply::Done
            }
            AdminVerb::SetServerFlag { name, flag } => {
                if !self
                    .snapshot
                    .alter_flags(&name, flag.as_role(), RoleFlags::empty())
                {
                    return AdminReply::Error {
                        message: format!("no server named {name:?}"),
                    };
                }
                // draining/maintenance invalidates pooled connections
                self.workers.broadcast_flush(&name).await;
                AdminReply::Done
            }
            AdminVerb::ClearServerFlag { name, flag } => {
                if !self
                    .snapshot
                    .alter_flags(&name, RoleFlags::empty(), flag.as_role())
                {
                    return AdminReply::Error {
                        message: format!("no server named {name:?}"),
                    };
                }
                self.workers.barrier().await;
                AdminReply::Done
            }
            AdminVerb::StopMonitor => {
                let _ = self.monitor_enabled.send(false);
                AdminReply::Done
            }
            AdminVerb::StartMonitor => {
                let _ = self.monitor_enabled.send(true);
                AdminReply::Done
            }
            AdminVerb::CreateService(service) => {
                let mut config = self.config.current().as_ref().clone();
                if config.service(&service.name).is_some() {
                    return AdminReply::Error {
                        message: format!("service {:?} already exists", service.name),
                    };
                }
                config.services.push(*service);
                self.config.publish(config);
                self.workers.barrier().await;
                AdminReply::Done
            }
            AdminVerb::DestroyService { name } => {
                let mut config = self.config.current().as_ref().clone();
                let before = config.services.len();
                config.services.retain(|s| s.name != name);
                if config.services.len() == before {
                    return AdminReply::Error {
                        message: format!("no service named {name:?}"),
                    };
                }
                self.config.publish(config);
                self.workers.barrier().await;
                AdminReply::Done
            }
            AdminVerb::AlterService(service) => {
                let mut config = self.config.current().as_ref().clone();
                let Some(existing) = config.services.iter_mut().find(|s| s.name == service.name)
                else {
                    return AdminReply::Error {
                        message: format!("no service named {:?}", service.name),
                    };
                };
                *existing = *service;
                self.config.publish(config);
                self.workers.barrier().await;
                AdminReply::Done
            }
            AdminVerb::CreateFilter(filter) => {
                let mut config = self.config.current().as_ref().clone();
                if config.filters.iter().any(|f| f.name == filter.name) {
                    return AdminReply::Error {
                        message: format!("filter {:?} already exists", filter.name),
                    };
                }
                config.filters.push(filter);
                self.config.publish(config);
                self.workers.barrier().await;
                AdminReply::Done
            }
            AdminVerb::DestroyFilter { name } => {
                let mut config = self.config.current().as_ref().clone();
                let before = config.filters.len();
                config.filters.retain(|f| f.name != name);
                if config.filters.len() == before {
                    return AdminReply::Error {
                        message: format!("no filter named {name:?}"),
                    };
                }
                self.config.publish(config);
                self.workers.barrier().await;
                AdminReply::Done
            }
            AdminVerb::AlterFilter(filter) => {
                let mut config = self.config.current().as_ref().clone();
                let Some(existing) = config.filters.iter_mut().find(|f| f.name == filter.name)
                else {
                    return AdminReply::Error {
                        message: format!("no filter named {:?}", filter.name),
                    };
                };
                *existing = filter;
                self.config.publish(config);
                self.workers.barrier().await;
                AdminReply::Done
            }
        }
    }
}
