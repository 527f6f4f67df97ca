use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub code: u16,
    pub message: String,
    pub data: T,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            code: u16::from(StatusCode::OK),
            message: "success".to_string(),
            data,
        }
    }
}

#[derive(Clone)]
pub struct MetricsHandler;

pub fn route_metrics(handler: MetricsHandler) -> Router {
    Router::new()
        .route("/metrics", get(render_metrics))
        .with_state(handler)
}

async fn render_metrics() -> impl IntoResponse {
    match common::metrics::try_handle() {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            "metrics recorder not initialized".to_string(),
        ),
    }
}
