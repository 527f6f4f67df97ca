use crate::http_handler::ApiResponse;
use crate::http_server::ProxyAdminRestState;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use proxy::config::{FilterConfig, ServiceConfig};
use proxy::server::admin::{AdminReply, AdminVerb, ServerFlagName};
use serde::Deserialize;
use std::str::FromStr;

fn reply_to_response(reply: AdminReply) -> (StatusCode, Json<AdminReply>) {
    let status = match &reply {
        AdminReply::Error { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::OK,
    };
    (status, Json(reply))
}

pub async fn list_servers(State(state): State<ProxyAdminRestState>) -> impl IntoResponse {
    let reply = state.admin().lock().await.execute(AdminVerb::ListServers).await;
    reply_to_response(reply)
}

#[derive(Debug, Deserialize)]
pub struct AlterServerBody {
    pub rank: Option<i32>,
}

pub async fn alter_server(
    State(state): State<ProxyAdminRestState>,
    Path(name): Path<String>,
    Json(body): Json<AlterServerBody>,
) -> impl IntoResponse {
    let reply = state
        .admin()
        .lock()
        .await
        .execute(AdminVerb::AlterServer {
            name,
            rank: body.rank,
        })
        .await;
    reply_to_response(reply)
}

pub async fn set_server_flag(
    State(state): State<ProxyAdminRestState>,
    Path((name, flag)): Path<(String, String)>,
) -> impl IntoResponse {
    let Ok(flag) = ServerFlagName::from_str(&flag) else {
        return reply_to_response(AdminReply::Error {
            message: format!("unknown server flag {flag:?}"),
        });
    };
    let reply = state
        .admin()
        .lock()
        .await
        .execute(AdminVerb::SetServerFlag { name, flag })
        .await;
    reply_to_response(reply)
}

pub async fn clear_server_flag(
    State(state): State<ProxyAdminRestState>,
    Path((name, flag)): Path<(String, String)>,
) -> impl IntoResponse {
    let Ok(flag) = ServerFlagName::from_str(&flag) else {
        return reply_to_response(AdminReply::Error {
            message: format!("unknown server flag {flag:?}"),
        });
    };
    let reply = state
        .admin()
        .lock()
        .await
        .execute(AdminVerb::ClearServerFlag { name, flag })
        .await;
    reply_to_response(reply)
}

pub async fn stop_monitor(State(state): State<ProxyAdminRestState>) -> impl IntoResponse {
    let reply = state.admin().lock().await.execute(AdminVerb::StopMonitor).await;
    reply_to_response(reply)
}

pub async fn start_monitor(State(state): State<ProxyAdminRestState>) -> impl IntoResponse {
    let reply = state.admin().lock().await.execute(AdminVerb::StartMonitor).await;
    reply_to_response(reply)
}

pub async fn create_service(
    State(state): State<ProxyAdminRestState>,
    Json(service): Json<ServiceConfig>,
) -> impl IntoResponse {
    let reply = state
        .admin()
        .lock()
        .await
        .execute(AdminVerb::CreateService(Box::new(service)))
        .await;
    reply_to_response(reply)
}

pub async fn alter_service(
    State(state): State<ProxyAdminRestState>,
    Json(service): Json<ServiceConfig>,
) -> impl IntoResponse {
    let reply = state
        .admin()
        .lock()
        .await
        .execute(AdminVerb::AlterService(Box::new(service)))
        .await;
    reply_to_response(reply)
}

pub async fn destroy_service(
    State(state): State<ProxyAdminRestState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    let reply = state
        .admin()
        .lock()
        .await
        .execute(AdminVerb::DestroyService { name })
        .await;
    reply_to_response(reply)
}

pub async fn create_filter(
    State(state): State<ProxyAdminRestState>,
    Json(filter): Json<FilterConfig>,
) -> impl IntoResponse {
    let reply = state
        .admin()
        .lock()
        .await
        .execute(AdminVerb::CreateFilter(filter))
        .await;
    reply_to_response(reply)
}

pub async fn alter_filter(
    State(state): State<ProxyAdminRestState>,
    Json(filter): Json<FilterConfig>,
) -> impl IntoResponse {
    let reply = state
        .admin()
        .lock()
        .await
        .execute(AdminVerb::AlterFilter(filter))
        .await;
    reply_to_response(reply)
}

pub async fn destroy_filter(
    State(state): State<ProxyAdminRestState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    let reply = state
        .admin()
        .lock()
        .await
        .execute(AdminVerb::DestroyFilter { name })
        .await;
    reply_to_response(reply)
}

pub async fn health() -> impl IntoResponse {
    Json(ApiResponse::ok("up"))
}
