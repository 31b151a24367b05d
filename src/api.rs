use crate::config::Config;
use crate::engine::{EngineError, ForwardingEngine};
use crate::stats::StatsSnapshot;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const TOKEN_HEADER: &str = "X-Chat-Relay-Token";

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub engine: Arc<ForwardingEngine>,
    pub shutdown: CancellationToken,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RuleStatus {
    pub name: String,
    pub enabled: bool,
    pub sources: Vec<String>,
    pub targets: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub running: bool,
    pub rules: Vec<RuleStatus>,
    pub counters: StatsSnapshot,
}

#[derive(Debug, Deserialize)]
pub struct ToggleRequest {
    pub enabled: bool,
}

pub fn router(state: AppState) -> Router {
    let authed_routes = Router::new()
        .route("/v1/status", get(status))
        .route("/v1/rules/:name", post(toggle_rule))
        .route("/v1/engine/restart", post(restart_engine))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let public_routes = Router::new().route("/v1/health", get(health));

    Router::new()
        .merge(authed_routes)
        .merge(public_routes)
        .with_state(state)
}

async fn require_auth(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> impl IntoResponse {
    if let Some(token) = state.config.auth.token.as_ref() {
        let header = headers.get(TOKEN_HEADER).and_then(|v| v.to_str().ok());
        if header != Some(token.as_str()) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }
    next.run(req).await
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let status = if state.engine.is_running() {
        "ok"
    } else {
        "stopped"
    };
    Json(HealthResponse {
        status: status.to_string(),
    })
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let rules = state
        .engine
        .rules()
        .rules()
        .iter()
        .map(|rule| RuleStatus {
            name: rule.name.clone(),
            enabled: rule.enabled,
            sources: rule.sources.iter().map(|c| c.to_string()).collect(),
            targets: rule.targets.iter().map(|c| c.to_string()).collect(),
        })
        .collect();
    Json(StatusResponse {
        running: state.engine.is_running(),
        rules,
        counters: state.engine.counters(),
    })
}

async fn toggle_rule(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<ToggleRequest>,
) -> impl IntoResponse {
    if state.engine.set_rule_enabled(&name, req.enabled) {
        (
            StatusCode::OK,
            Json(json!({"name": name, "enabled": req.enabled})),
        )
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("unknown rule {}", name)})),
        )
    }
}

async fn restart_engine(State(state): State<AppState>) -> impl IntoResponse {
    match state.engine.restart().await {
        Ok(()) => (StatusCode::OK, Json(json!({"status": "restarted"}))),
        Err(EngineError::AlreadyRunning) => (
            StatusCode::CONFLICT,
            Json(json!({"error": EngineError::AlreadyRunning.to_string()})),
        ),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": err.to_string()})),
        ),
    }
}
