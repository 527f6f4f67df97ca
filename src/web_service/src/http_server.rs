use crate::http_handler::*;
use crate::proxy_handler::*;

use anyhow::anyhow;
use axum::routing::{delete, get, post, put};
use axum::Router;
use proxy::server::admin::AdminController;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tower_http::trace::{DefaultMakeSpan, TraceLayer};

pub struct ProxyAdminRest;

#[derive(Clone)]
pub struct ProxyAdminRestState {
    admin: Arc<Mutex<AdminController>>,
}

impl ProxyAdminRestState {
    pub fn admin(&self) -> &Arc<Mutex<AdminController>> {
        &self.admin
    }
}

impl ProxyAdminRest {
    pub async fn start_server<F>(
        addr: String,
        port: u16,
        enable_metric: bool,
        admin: Arc<Mutex<AdminController>>,
        shutdown: F,
    ) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app_state = ProxyAdminRestState { admin };
        let mut app = Router::new()
            .route("/", get(health))
            .route("/v1/servers", get(list_servers))
            .route("/v1/servers/:name", put(alter_server))
            .route("/v1/servers/:name/set/:flag", post(set_server_flag))
            .route("/v1/servers/:name/clear/:flag", post(clear_server_flag))
            .route("/v1/monitor/stop", post(stop_monitor))
            .route("/v1/monitor/start", post(start_monitor))
            .route("/v1/services", post(create_service).put(alter_service))
            .route("/v1/services/:name", delete(destroy_service))
            .route("/v1/filters", post(create_filter).put(alter_filter))
            .route("/v1/filters/:name", delete(destroy_filter))
            .with_state(app_state);

        if enable_metric {
            app = app.merge(route_metrics(MetricsHandler {}));
        }

        app = app.layer(TraceLayer::new_for_http().make_span_with(DefaultMakeSpan::new()));
        let listener = tokio::net::TcpListener::bind(format!("{addr}:{port}"))
            .await
            .map_err(|e| anyhow!("failed to bind admin listener: {e}"))?;

        match axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => Err(anyhow!(e.to_string())),
        }
    }
}
