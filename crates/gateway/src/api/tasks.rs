//! Task endpoints.
//!
//! - `POST /tasks`             — create a task and start it if a device is free
//! - `GET  /tasks`             — list (limit/offset/status/device filters)
//! - `GET  /tasks/:id`         — query one task
//! - `POST /tasks/:id/cancel`
//! - `POST /tasks/:id/answer`  — supply a user answer (wakes `ask_user`)

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use uuid::Uuid;

use crate::api::{api_error, domain_error};
use crate::state::AppState;
use crate::tasks::{TaskSpec, TaskStatus};

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    50
}

#[derive(Debug, Deserialize)]
pub struct AnswerRequest {
    pub answer: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /tasks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn create(State(state): State<AppState>, Json(spec): Json<TaskSpec>) -> Response {
    let task = match state.scheduler.create_task(spec) {
        Ok(task) => task,
        Err(e) => return domain_error(e),
    };

    // Execution is attempted immediately; a busy fleet leaves the task
    // pending for a later execute.
    let scheduled = match state.scheduler.execute(task.id) {
        Ok(()) => true,
        Err(e) => {
            tracing::info!(task_id = %task.id, error = %e, "task queued, not started");
            false
        }
    };

    let task = state.scheduler.get(&task.id).unwrap_or(task);
    (
        StatusCode::CREATED,
        Json(serde_json::json!({
            "task": task,
            "scheduled": scheduled,
        })),
    )
        .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /tasks, GET /tasks/:id
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn list(State(state): State<AppState>, Query(query): Query<ListQuery>) -> Response {
    let status = match &query.status {
        Some(raw) => match TaskStatus::parse(raw) {
            Some(status) => Some(status),
            None => {
                return api_error(StatusCode::BAD_REQUEST, format!("unknown status: {raw}"))
            }
        },
        None => None,
    };
    let tasks = state.scheduler.list(
        status,
        query.device_id.as_deref(),
        query.limit.min(500),
        query.offset,
    );
    let count = tasks.len();
    Json(serde_json::json!({
        "tasks": tasks,
        "count": count,
    }))
    .into_response()
}

pub async fn get(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.scheduler.get(&id) {
        Some(task) => Json(task).into_response(),
        None => api_error(StatusCode::NOT_FOUND, format!("task {id} not found")),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /tasks/:id/cancel, POST /tasks/:id/answer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn cancel(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.scheduler.cancel(id) {
        Ok(_) => Json(serde_json::json!({
            "task_id": id,
            "status": "cancelled",
        }))
        .into_response(),
        Err(e) => domain_error(e),
    }
}

pub async fn answer(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<AnswerRequest>,
) -> Response {
    if body.answer.is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "answer must not be empty");
    }
    match state.scheduler.answer(id, body.answer) {
        Ok(()) => Json(serde_json::json!({
            "task_id": id,
            "accepted": true,
        }))
        .into_response(),
        Err(e) => domain_error(e),
    }
}
