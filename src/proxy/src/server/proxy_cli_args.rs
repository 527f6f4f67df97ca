use crate::backend::router::{FailureMode, RouterConfig, SlaveSelection};
use crate::config::{LimitsConfig, ListenerConfig, ProxyConfig, ServerEntry, ServiceConfig};

use clap::{Parser, Subcommand};
use std::str::FromStr;

#[derive(Parser, Default, Debug, Clone)]
#[clap(
    name = "rws-proxy",
    version = "0.1.0",
    about = "MariaDB-compatible proxy with read/write split routing."
)]
pub struct ProxyServerArgs {
    #[clap(long, value_name = "WORKERS", default_value_t = 4)]
    pub workers: usize,
    #[clap(long, value_name = "PORT", default_value_t = 4006)]
    pub port: u16,
    #[clap(long, value_name = "HTTP_PORT", default_value_t = 9000)]
    pub http_port: u16,
    #[clap(long, value_name = "TLS", default_value_t = false)]
    pub tls: bool,
    #[clap(long, value_name = "ENABLE REST API", default_value_t = false)]
    pub enable_rest: bool,
    #[clap(long, value_name = "SERVICE_USER", default_value = "proxy")]
    pub user: String,
    #[clap(long, value_name = "SERVICE_PASSWORD", default_value = "")]
    pub password: String,
    #[clap(long, value_name = "SLAVE_SELECTION")]
    pub slave_selection: Option<String>,
    #[clap(long, value_name = "FAILURE_MODE")]
    pub failure_mode: Option<String>,
    #[clap(long, value_name = "MASTER_RECONNECTION", default_value_t = false)]
    pub master_reconnection: bool,
    #[clap(long, value_name = "LOG_LEVEL")]
    pub log_level: Option<String>,
    #[clap(subcommand)]
    pub backend: Option<BackendConfigArgs>,
}

#[derive(Subcommand, Clone, Debug, PartialEq, Eq)]
#[command(next_line_help = true)]
pub enum BackendConfigArgs {
    #[command(long_about = "Proxy a static list of backends. The first one is the master.")]
    Backend {
        /// Comma-separated host:port list.
        #[clap(long)]
        backend_addrs: String,
    },
}

impl ProxyServerArgs {
    pub fn router_options(&self) -> RouterConfig {
        let slave_selection = self
            .slave_selection
            .as_deref()
            .and_then(|s| SlaveSelection::from_str(&s.to_lowercase()).ok())
            .unwrap_or_default();
        let failure_mode = self
            .failure_mode
            .as_deref()
            .and_then(|s| FailureMode::from_str(&s.to_lowercase()).ok())
            .unwrap_or_default();
        RouterConfig {
            slave_selection,
            failure_mode,
            master_reconnection: self.master_reconnection,
            ..Default::default()
        }
    }

    fn static_servers(&self) -> Vec<ServerEntry> {
        let addrs = match &self.backend {
            Some(BackendConfigArgs::Backend { backend_addrs }) => backend_addrs.clone(),
            None => "127.0.0.1:3306".to_string(),
        };
        addrs
            .split(',')
            .enumerate()
            .map(|(idx, addr)| {
                let (host, port) = addr
                    .rsplit_once(':')
                    .map(|(h, p)| (h.to_string(), p.parse().unwrap_or(3306)))
                    .unwrap_or_else(|| (addr.to_string(), 3306));
                ServerEntry {
                    name: format!("server{}", idx + 1),
                    address: host,
                    port,
                    tls: false,
                    rank: crate::backend::monitor::RANK_PRIMARY,
                    initial_pool_size: 0,
                    proxy_protocol: None,
                    connection_init_queries: Vec::new(),
                }
            })
            .collect()
    }

    /// Materialize the typed configuration snapshot the core consumes.
    pub fn to_proxy_config(&self) -> ProxyConfig {
        let service = ServiceConfig {
            name: "rw-split".to_string(),
            router: "readwritesplit".to_string(),
            user: self.user.clone(),
            password: self.password.clone(),
            router_options: self.router_options(),
            limits: LimitsConfig::default(),
        };
        let listener = ListenerConfig {
            name: "default".to_string(),
            address: "0.0.0.0".to_string(),
            port: self.port,
            protocol: "mariadb".to_string(),
            tls: None,
            service: service.name.clone(),
        };
        ProxyConfig {
            listeners: vec![listener],
            services: vec![service],
            servers: self.static_servers(),
            filters: Vec::new(),
            monitor: None,
            workers: self.workers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_backend_list_parsing() {
        let args = ProxyServerArgs {
            backend: Some(BackendConfigArgs::Backend {
                backend_addrs: "10.0.0.1:3306,10.0.0.2:3307".to_string(),
            }),
            ..Default::default()
        };
        let config = args.to_proxy_config();
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers[0].name, "server1");
        assert_eq!(config.servers[1].port, 3307);
    }

    #[test]
    fn router_options_from_strings() {
        let args = ProxyServerArgs {
            slave_selection: Some("round_robin".to_string()),
            failure_mode: Some("fail_on_write".to_string()),
            ..Default::default()
        };
        let opts = args.router_options();
        assert_eq!(opts.slave_selection, SlaveSelection::RoundRobin);
        assert_eq!(opts.failure_mode, FailureMode::FailOnWrite);
    }
}
