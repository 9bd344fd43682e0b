//! Device endpoints.
//!
//! Device status is live-derived from the registry; the SQLite `devices`
//! table is only a durable mirror for counters across restarts.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::Value;

use fg_protocol::WsMessage;

use crate::api::api_error;
use crate::state::AppState;

pub async fn list(State(state): State<AppState>) -> Response {
    let devices = state.registry.list(None);
    let count = devices.len();
    Json(serde_json::json!({
        "devices": devices,
        "count": count,
    }))
    .into_response()
}

pub async fn get(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.registry.get(&id) {
        Some(device) => Json(device).into_response(),
        None => api_error(StatusCode::NOT_FOUND, format!("device {id} not found")),
    }
}

pub async fn stats(State(state): State<AppState>) -> Response {
    Json(state.registry.stats()).into_response()
}

/// Opaque passthrough: forward an arbitrary JSON payload to the device's
/// control WebSocket.
pub async fn command(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<Value>,
) -> Response {
    if state.registry.get(&id).is_none() {
        return api_error(StatusCode::NOT_FOUND, format!("device {id} not found"));
    }
    let delivered = state.sockets.send(&id, WsMessage::Command { payload }).await;
    if !delivered {
        return api_error(
            StatusCode::CONFLICT,
            format!("device {id} has no live control channel"),
        );
    }
    Json(serde_json::json!({ "device_id": id, "delivered": true })).into_response()
}

#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    pub name: String,
}

pub async fn rename(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<RenameRequest>,
) -> Response {
    if body.name.trim().is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "name must not be empty");
    }
    if !state.registry.rename(&id, body.name.trim()) {
        return api_error(StatusCode::NOT_FOUND, format!("device {id} not found"));
    }
    if let Some(device) = state.registry.get(&id) {
        state.store.upsert_device(&device);
    }
    Json(serde_json::json!({ "device_id": id, "name": body.name.trim() })).into_response()
}
