use crate::logging::request_id_middleware;
use crate::main_helper::AppState;
use crate::proxy::client_ip;
use crate::types::{LogEntry, StatusReport};
use crate::ws::ws_handler;
use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, Request, StatusCode},
    middleware,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;

const DASHBOARD_HTML: &str = include_str!("../static/dashboard.html");

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetUpdate {
    pub target_url: String,
}

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/api/debug/status", get(debug_status))
        .route("/api/debug/toggle", post(toggle_debug))
        .route("/api/logs", get(list_logs).delete(clear_logs))
        .route("/api/proxy/target", post(update_target))
        .layer(CorsLayer::permissive());

    Router::new()
        .route("/debug", get(dashboard))
        .route("/debug/", get(dashboard))
        .route("/ws", get(ws_handler))
        .merge(api)
        .fallback(proxy_handler)
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

pub async fn dashboard() -> Html<&'static str> {
    Html(DASHBOARD_HTML)
}

pub async fn debug_status(State(state): State<AppState>) -> Json<StatusReport> {
    Json(state.hub.status())
}

pub async fn toggle_debug(State(state): State<AppState>) -> Json<StatusReport> {
    Json(state.hub.toggle_debug().await)
}

pub async fn list_logs(State(state): State<AppState>) -> Json<Vec<LogEntry>> {
    Json(state.hub.logs.get_all().await)
}

pub async fn clear_logs(State(state): State<AppState>) -> Json<serde_json::Value> {
    let success = state.hub.clear_logs().await;
    Json(serde_json::json!({ "success": success }))
}

pub async fn update_target(
    State(state): State<AppState>,
    Json(update): Json<TargetUpdate>,
) -> Response {
    match state.hub.set_target(&update.target_url).await {
        Ok(next) => (
            StatusCode::OK,
            Json(serde_json::json!({ "success": true, "targetUrl": next.target_url })),
        )
            .into_response(),
        Err(e) => {
            tracing::warn!("Rejected target update: {}", e);
            e.into_response()
        }
    }
}

pub async fn proxy_handler(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    request: Request<Body>,
) -> Response {
    let ip = client_ip(&headers, peer.map(|ConnectInfo(addr)| addr));
    state.forwarder.forward(&state.hub, request, ip).await
}
