// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// The dashboard surface is intentionally thin: `/health` is public, `/status`
// serves the latest snapshot the control loop persisted to the Store, and
// `/command` is the sole write path into the engine (BULK_SELL, BACKTEST_REQ).
// Everything else — positions, regime, trade journal — lives inside the
// persisted StatusSnapshot rather than as its own endpoint.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::types::CommandType;

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/command", post(command))
        .layer(cors)
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.uptime_secs(),
    })
}

async fn status(
    AuthBearer(_): AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    match state.latest_status().await {
        Some(snapshot) => (StatusCode::OK, Json(snapshot)).into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": "no status snapshot yet" })),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
struct CommandRequest {
    cmd_type: CommandRequestType,
    #[serde(default)]
    payload: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum CommandRequestType {
    BulkSell,
    BacktestReq,
}

async fn command(
    AuthBearer(_): AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<CommandRequest>,
) -> impl IntoResponse {
    let cmd_type = match req.cmd_type {
        CommandRequestType::BulkSell => CommandType::BulkSell,
        CommandRequestType::BacktestReq => CommandType::BacktestReq,
    };
    info!(?cmd_type, "api: command enqueued");
    state.store.push_command(cmd_type, req.payload).await;
    StatusCode::ACCEPTED
}
