// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! REST facade — exposes the broker manager verbs.
//!
//! Endpoints:
//!   GET  /status                  → current state machine status
//!   POST /parameters              → configure the next acquisition
//!   PUT  /start_pulse_id/{pid}    → open the acquisition window
//!   PUT  /stop_pulse_id/{pid}     → close the window and emit
//!   GET  /stop                    → reset without emitting
//!   GET  /statistics              → processed request counters
//!   GET  /kill                    → terminate the process
//!   POST /retrieve_from_buffers   → one-shot retrieve
//!
//! Every failure is trapped and returned as `{state:"error", status:<msg>}`
//! with HTTP 200, so shell clients can always parse the reply.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, State};
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::broker::BrokerManager;

/// Shared state passed to all handlers.
pub struct AppState {
    pub manager: tokio::sync::Mutex<BrokerManager>,
}

/// Build the axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/status", get(handle_status))
        .route("/parameters", post(handle_parameters))
        .route("/start_pulse_id/{pulse_id}", put(handle_start_pulse_id))
        .route("/stop_pulse_id/{pulse_id}", put(handle_stop_pulse_id))
        .route("/stop", get(handle_stop))
        .route("/statistics", get(handle_statistics))
        .route("/kill", get(handle_kill))
        .route("/retrieve_from_buffers", post(handle_retrieve))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn start_server(state: Arc<AppState>, rest_port: u16) {
    let app = build_router(state);
    let addr = format!("0.0.0.0:{rest_port}");
    info!(rest_port, "REST api listening on http://{}", addr);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, "Failed to bind REST api");
            return;
        }
    };

    if let Err(e) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    {
        error!(error = %e, "REST api server error");
    }
}

fn error_reply(message: impl std::fmt::Display) -> Json<Value> {
    error!("{message}");
    Json(json!({"state": "error", "status": message.to_string()}))
}

// ──────────────── handlers ────────────────────────────────────────────────

async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let manager = state.manager.lock().await;
    Json(json!({"state": "ok", "status": manager.get_status()}))
}

async fn handle_parameters(
    State(state): State<Arc<AppState>>,
    body: String,
) -> impl IntoResponse {
    let Ok(body) = serde_json::from_str::<Value>(&body) else {
        return error_reply("parameters body is not valid JSON");
    };
    let Some(parameters) = body.as_object().cloned() else {
        return error_reply("parameters body must be a JSON object");
    };

    let mut manager = state.manager.lock().await;
    match manager.set_parameters(parameters) {
        Ok(()) => Json(json!({
            "state": "ok",
            "status": manager.get_status(),
            "parameters": manager.get_parameters(),
        })),
        Err(e) => error_reply(e),
    }
}

async fn handle_start_pulse_id(
    State(state): State<Arc<AppState>>,
    Path(pulse_id): Path<String>,
) -> impl IntoResponse {
    info!(pulse_id, "Received start_pulse_id");

    let Ok(pulse_id) = pulse_id.parse::<u64>() else {
        return error_reply(format!("start pulse id '{pulse_id}' is not an integer"));
    };

    let mut manager = state.manager.lock().await;
    manager.start_writer(pulse_id);
    Json(json!({"state": "ok", "status": manager.get_status()}))
}

async fn handle_stop_pulse_id(
    State(state): State<Arc<AppState>>,
    Path(pulse_id): Path<String>,
) -> impl IntoResponse {
    info!(pulse_id, "Received stop_pulse_id");

    let Ok(pulse_id) = pulse_id.parse::<u64>() else {
        return error_reply(format!("stop pulse id '{pulse_id}' is not an integer"));
    };

    let mut manager = state.manager.lock().await;
    manager.stop_writer(pulse_id).await;
    Json(json!({"state": "ok", "status": manager.get_status()}))
}

async fn handle_stop(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut manager = state.manager.lock().await;
    manager.stop();
    Json(json!({"state": "ok", "status": manager.get_status()}))
}

async fn handle_statistics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let manager = state.manager.lock().await;
    match serde_json::to_value(manager.get_statistics()) {
        Ok(statistics) => Json(json!({
            "state": "ok",
            "status": manager.get_status(),
            "statistics": statistics,
        })),
        Err(e) => error_reply(e),
    }
}

async fn handle_kill() -> Json<Value> {
    info!("Kill requested, terminating");
    std::process::exit(0)
}

async fn handle_retrieve(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    body: String,
) -> impl IntoResponse {
    let Ok(body) = serde_json::from_str::<Value>(&body) else {
        return error_reply("retrieve body is not valid JSON");
    };
    let remote_ip = peer.ip().to_string();
    let beamline_force = body
        .get("beamline_force")
        .and_then(Value::as_str)
        .map(str::to_string);

    let mut manager = state.manager.lock().await;
    let outcome = manager
        .retrieve(&body, &remote_ip, beamline_force.as_deref())
        .await;

    match serde_json::to_value(&outcome) {
        Ok(value) => Json(value),
        Err(e) => error_reply(e),
    }
}
