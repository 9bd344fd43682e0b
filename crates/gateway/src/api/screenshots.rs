//! Screenshot endpoints.
//!
//! - `GET  /screenshots/task/:id/summary`
//! - `GET  /screenshots/task/:id/step/:step/image?size=…`
//! - `POST /screenshots/task/:id/export` → gzip archive

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;

use crate::api::api_error;
use crate::state::AppState;

pub async fn summary(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let steps = state.screenshots.task_steps(&id);
    let summary = state.screenshots.summary(&id);
    if steps.is_empty() && summary.is_none() {
        return api_error(StatusCode::NOT_FOUND, format!("no screenshots for task {id}"));
    }
    Json(serde_json::json!({
        "task_id": id,
        "summary": summary,
        "steps": steps,
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
pub struct ImageQuery {
    /// `original`, `ai`, `medium`, `small`, or `thumbnail`.
    #[serde(default = "default_size")]
    pub size: String,
    /// Legacy flag: `?thumb=true` is shorthand for `size=thumbnail`.
    #[serde(default)]
    pub thumb: bool,
}

fn default_size() -> String {
    "medium".to_owned()
}

pub async fn step_image(
    State(state): State<AppState>,
    Path((id, step)): Path<(String, u32)>,
    Query(query): Query<ImageQuery>,
) -> Response {
    let size = if query.thumb {
        "thumbnail"
    } else {
        query.size.as_str()
    };
    let Some(path) = state.screenshots.step_image_path(&id, step, size) else {
        return api_error(
            StatusCode::NOT_FOUND,
            format!("no image for task {id} step {step}"),
        );
    };
    let content_type = if path.extension().is_some_and(|e| e == "png") {
        "image/png"
    } else {
        "image/jpeg"
    };
    match tokio::fs::read(&path).await {
        Ok(bytes) => ([(header::CONTENT_TYPE, content_type)], bytes).into_response(),
        Err(e) => api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("read image: {e}"),
        ),
    }
}

pub async fn export(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let screenshots = state.screenshots.clone();
    let task_id = id.clone();
    // Archiving a long task is filesystem-heavy; keep it off the reactor.
    let archive = tokio::task::spawn_blocking(move || screenshots.export_task(&task_id)).await;
    let path = match archive {
        Ok(Ok(path)) => path,
        Ok(Err(e)) => return api_error(StatusCode::NOT_FOUND, e.to_string()),
        Err(e) => {
            return api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("export: {e}"))
        }
    };
    match tokio::fs::read(&path).await {
        Ok(bytes) => (
            [
                (header::CONTENT_TYPE, "application/gzip".to_owned()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{id}.tar.gz\""),
                ),
            ],
            bytes,
        )
            .into_response(),
        Err(e) => api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("read archive: {e}"),
        ),
    }
}
