use clap::Parser;
use common::ShutdownMessage;
use proxy::server::proxy_cli_args::ProxyServerArgs;
use proxy::server::proxy_server::SplitProxyServer;
use proxy::server::worker::WorkerTlsConfig;
use std::str::FromStr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tokio::sync::watch;
use tokio::sync::watch::Receiver;
use tokio::sync::Mutex;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

async fn shutdown_await(mut shutdown_rx: Box<Receiver<ShutdownMessage>>) {
    let changed_rs = &shutdown_rx.changed().await;
    if changed_rs.is_ok() {
        let canceled = shutdown_rx.borrow_and_update().clone();
        if let ShutdownMessage::Cancel(msg) = canceled {
            info!("ProxySrv process receive shutdown msg {msg}");
        }
    }
}

async fn shutdown_signal() -> ShutdownMessage {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        ctrl_c_v = ctrl_c => {
            let msg = format!("ProxySrv receive ctrl_c signal  {ctrl_c_v:?}");
            ShutdownMessage::Cancel(msg)
        },
        v = terminate => {
            let msg =  format!("ProxySrv receive terminate signal  {v:?}");
            ShutdownMessage::Cancel(msg)
        },
    }
}

fn start_metrics_and_rest(
    proxy_args: &ProxyServerArgs,
    runtime: &Runtime,
    admin: Arc<Mutex<proxy::server::admin::AdminController>>,
    shutdown_rx: &Receiver<ShutdownMessage>,
) {
    let http_port = proxy_args.http_port;
    if proxy_args.enable_rest {
        common::metrics::init_metrics_context();
        let shutdown_rx_clone = Box::new(shutdown_rx.clone());
        runtime.spawn(async move {
            web_service::http_server::ProxyAdminRest::start_server(
                "0.0.0.0".to_string(),
                http_port,
                true,
                admin,
                shutdown_await(shutdown_rx_clone),
            )
            .await
        });
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let proxy_args = ProxyServerArgs::parse();
    let log_level_string = proxy_args.log_level.clone().unwrap_or("INFO".to_string());
    let level = Level::from_str(log_level_string.as_str())?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("INFO,hyper=INFO,tower=INFO,h2=INFO"))
        .add_directive(level.into())
        .add_directive("hyper=INFO".parse().unwrap())
        .add_directive("h2=INFO".parse().unwrap())
        .add_directive("tower=INFO".parse().unwrap());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_line_number(true)
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("RWS_PROXY")
        .worker_threads(2)
        .build()?;

    info!("ProxySrv running config args={:?}", proxy_args);
    let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownMessage::Init);

    let config = proxy_args.to_proxy_config();
    let port = proxy_args.port;
    let (proxy_srv, admin) = SplitProxyServer::new(config, WorkerTlsConfig::default());
    let admin = Arc::new(Mutex::new(admin));
    start_metrics_and_rest(&proxy_args, &runtime, Arc::clone(&admin), &shutdown_rx);

    runtime.block_on(async {
        let tcp_listener = TcpListener::bind(format!("0.0.0.0:{port}")).await?;
        let serve = proxy_srv.serve(tcp_listener, shutdown_rx.clone());
        tokio::pin!(serve);
        tokio::select! {
            shutdown_msg = shutdown_signal() => {
                shutdown_tx.send(shutdown_msg.clone()).unwrap();
            }
            rs = &mut serve => {
                if let Err(e) = rs {
                    warn!("ProxySrv listener stopped with error {e:?}");
                }
            }
        }
        Ok::<(), std::io::Error>(())
    })?;
    Ok(())
}
