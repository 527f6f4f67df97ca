use crate::backend::reply::ResultSizeAction;
use crate::backend::router::RouterConfig;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

/// Outbound proxy-protocol header emitted before the first MariaDB byte on
/// a backend socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyProtocol {
    V1,
    V2,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct TlsConfig {
    pub cert_path: String,
    pub key_path: String,
    #[serde(default)]
    pub ca_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ListenerConfig {
    pub name: String,
    pub address: String,
    pub port: u16,
    /// Protocol module name; only "mariadb" is known to the core.
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    /// Name of the service this listener feeds.
    pub service: String,
}

fn default_protocol() -> String {
    "mariadb".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ServiceConfig {
    pub name: String,
    /// Router module name; "readwritesplit" is the one implemented here.
    pub router: String,
    pub user: String,
    pub password: String,
    #[serde(default)]
    pub router_options: RouterConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ServerEntry {
    pub name: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
    #[serde(default = "default_rank")]
    pub rank: i32,
    #[serde(default)]
    pub initial_pool_size: u32,
    #[serde(default)]
    pub proxy_protocol: Option<ProxyProtocol>,
    /// Initialisation queries run once per fresh connection; each must
    /// answer with OK.
    #[serde(default)]
    pub connection_init_queries: Vec<String>,
}

fn default_rank() -> i32 {
    crate::backend::monitor::RANK_SECONDARY
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct MonitorConfig {
    /// Probe interval in milliseconds.
    #[serde(default = "default_monitor_interval")]
    pub interval_ms: u64,
    pub user: String,
    pub password: String,
    pub servers: Vec<String>,
}

fn default_monitor_interval() -> u64 {
    2500
}

/// Session resource limits and flow-control thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LimitsConfig {
    /// Cap on session-command history entries kept for replay.
    #[serde(default = "default_history_cap")]
    pub history_cap: usize,
    /// Cap on idle pooled backends per worker.
    #[serde(default = "default_pool_cap")]
    pub pool_cap: usize,
    /// Pause the opposite read side when an outbound buffer grows past this.
    #[serde(default = "default_high_water")]
    pub writeq_high_water: usize,
    /// Resume once it drains below this.
    #[serde(default = "default_low_water")]
    pub writeq_low_water: usize,
    #[serde(default = "default_idle_timeout")]
    pub client_idle_timeout_secs: u64,
    #[serde(default)]
    pub command_timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_result_rows: Option<u64>,
    #[serde(default)]
    pub max_result_size: Option<u64>,
    #[serde(default)]
    pub result_size_action: ResultSizeAction,
}

fn default_history_cap() -> usize {
    50
}

fn default_pool_cap() -> usize {
    crate::backend::pool::DEFAULT_POOL_CAP
}

fn default_high_water() -> usize {
    16 * 1024 * 1024
}

fn default_low_water() -> usize {
    8 * 1024 * 1024
}

fn default_idle_timeout() -> u64 {
    28800
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            history_cap: default_history_cap(),
            pool_cap: default_pool_cap(),
            writeq_high_water: default_high_water(),
            writeq_low_water: default_low_water(),
            client_idle_timeout_secs: default_idle_timeout(),
            command_timeout_secs: None,
            max_result_rows: None,
            max_result_size: None,
            result_size_action: ResultSizeAction::default(),
        }
    }
}

/// An externally implemented filter module attached to a service. The core
/// only carries the configuration; the filter chain itself is an external
/// collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FilterConfig {
    pub name: String,
    pub module: String,
    #[serde(default)]
    pub params: hashbrown::HashMap<String, String>,
}

/// The full typed configuration snapshot consumed from the external config
/// layer. Immutable; runtime reconfiguration publishes a new snapshot.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct ProxyConfig {
    pub listeners: Vec<ListenerConfig>,
    pub services: Vec<ServiceConfig>,
    pub servers: Vec<ServerEntry>,
    #[serde(default)]
    pub filters: Vec<FilterConfig>,
    #[serde(default)]
    pub monitor: Option<MonitorConfig>,
    /// Worker threads; sessions are pinned for life.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_workers() -> usize {
    4
}

impl ProxyConfig {
    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn server(&self, name: &str) -> Option<&ServerEntry> {
        self.servers.iter().find(|s| s.name == name)
    }
}

/// Single-writer handle for runtime reconfiguration; workers re-read at
/// session-boundary safe points, exactly like the server snapshot.
pub struct ConfigPublisher {
    tx: watch::Sender<Arc<ProxyConfig>>,
}

pub type ConfigReader = watch::Receiver<Arc<ProxyConfig>>;

impl ConfigPublisher {
    pub fn new(initial: ProxyConfig) -> (Self, ConfigReader) {
        let (tx, rx) = watch::channel(Arc::new(initial));
        (Self { tx }, rx)
    }

    pub fn publish(&self, config: ProxyConfig) {
        let _ = self.tx.send(Arc::new(config));
    }

    pub fn current(&self) -> Arc<ProxyConfig> {
        self.tx.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_swap_is_observed() {
        let (publisher, mut reader) = ConfigPublisher::new(ProxyConfig::default());
        assert_eq!(reader.borrow_and_update().workers, 4);
        publisher.publish(ProxyConfig {
            workers: 8,
            ..Default::default()
        });
        assert_eq!(reader.borrow_and_update().workers, 8);
    }

    #[test]
    fn limits_defaults_are_sane() {
        let limits = LimitsConfig::default();
        assert!(limits.writeq_low_water < limits.writeq_high_water);
        assert_eq!(limits.history_cap, 50);
        assert_eq!(limits.result_size_action, ResultSizeAction::TruncateWithEof);
    }
}
