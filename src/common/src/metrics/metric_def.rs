pub const PROXY_MAX_CONN: &str = "proxy_max_connections";
pub const PROXY_CURR_CONN: &str = "proxy_curr_connections";
pub const PROXY_COM_LATENCY: &str = "proxy_com_latency";
pub const PROXY_ROUTED_TO_MASTER: &str = "proxy_routed_to_master_total";
pub const PROXY_ROUTED_TO_SLAVE: &str = "proxy_routed_to_slave_total";
pub const PROXY_POOL_REUSE: &str = "proxy_pool_reuse_total";
pub const PROXY_HISTORY_REPLAYS: &str = "proxy_history_replays_total";

#[macro_export]
macro_rules! metrics_const {
    ($({$metric_name:ident, $init_fn:ident, $metric_type:expr, $name:expr, $desc:expr}),*) => {
        use metrics::KeyName;
        use std::sync::OnceLock;
        use $crate::metrics::MetricType;

        #[derive(Debug, Clone)]
        pub enum MetricsConsts {
           $($metric_name(&'static str, &'static str, KeyName, MetricType),)*
        }

        pub fn list_all_metrics() -> &'static Vec<MetricsConsts> {
           static ALL_METRICS: OnceLock<Vec<MetricsConsts>> = OnceLock::new();
           ALL_METRICS.get_or_init(|| {
              vec![$(MetricsConsts::$metric_name($name, $desc, KeyName::from_const_str($name), $metric_type),)*]
           })
        }

        impl MetricsConsts {
            $(
            #[inline]
            pub fn $init_fn() -> Self {
                MetricsConsts::$metric_name($name, $desc, KeyName::from_const_str($name), $metric_type)
            })*

            pub fn get_name(&self) -> String {
                let (name, _,_,_) = self.get_metrics_pair();
                name.to_string()
            }

            pub fn get_metrics_pair(&self) -> (&'static str, &'static str, &KeyName, &MetricType){
                match self {
                    $(
                    MetricsConsts::$metric_name(name, desc, key_name, metrics_type) => (name, desc, key_name, metrics_type),
                    )*
                }
            }
        }
    };
}

metrics_const!(
    { ProxyMaxConnections, max_connections, MetricType::Gauge, PROXY_MAX_CONN, "The max number of connections allowed by the proxy."},
    { ProxyCurrentConnections, current_connections, MetricType::Gauge, PROXY_CURR_CONN, "The current connection count."},
    { ProxyComLatency, com_latency, MetricType::Histogram, PROXY_COM_LATENCY, "Latency of command execution."},
    { ProxyRoutedToMaster, routed_to_master, MetricType::Counter, PROXY_ROUTED_TO_MASTER, "Statements routed to the master."},
    { ProxyRoutedToSlave, routed_to_slave, MetricType::Counter, PROXY_ROUTED_TO_SLAVE, "Statements routed to a slave."},
    { ProxyPoolReuse, pool_reuse, MetricType::Counter, PROXY_POOL_REUSE, "Pooled backend connections reused."},
    { ProxyHistoryReplays, history_replays, MetricType::Counter, PROXY_HISTORY_REPLAYS, "Session command histories replayed onto backends."}
);
