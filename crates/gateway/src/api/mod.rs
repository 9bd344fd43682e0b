//! Control-plane HTTP surface.

pub mod devices;
pub mod screenshots;
pub mod tasks;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

/// Build a standardized JSON error response: `{ "error": "<message>" }`.
pub(crate) fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

/// Map a domain error onto an HTTP status.
pub(crate) fn domain_error(e: fg_domain::Error) -> Response {
    use fg_domain::Error;
    let status = match &e {
        Error::Task(_) | Error::Parse(_) | Error::Config(_) => StatusCode::BAD_REQUEST,
        Error::Device(_) => StatusCode::CONFLICT,
        Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(status, e.to_string())
}

/// Build the full router.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Health
        .route("/health", get(health))
        // Tasks
        .route("/tasks", post(tasks::create).get(tasks::list))
        .route("/tasks/:id", get(tasks::get))
        .route("/tasks/:id/cancel", post(tasks::cancel))
        .route("/tasks/:id/answer", post(tasks::answer))
        // Devices
        .route("/devices", get(devices::list))
        .route("/devices/stats", get(devices::stats))
        .route("/devices/:id", get(devices::get))
        .route("/devices/:id/command", post(devices::command))
        .route("/devices/:id/rename", post(devices::rename))
        // Screenshots
        .route(
            "/screenshots/task/:id/summary",
            get(screenshots::summary),
        )
        .route(
            "/screenshots/task/:id/step/:step/image",
            get(screenshots::step_image),
        )
        .route("/screenshots/task/:id/export", post(screenshots::export))
        // Device control WebSocket
        .route("/ws/device/:frp_port", get(crate::ws::device_ws))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now(),
    }))
}
