//! The concierge chat endpoint.

use std::time::Duration;

use axum::extract::State;
use axum::{Extension, Json};
use serde::Deserialize;

use crate::api::{ApiError, AppState};
use crate::concierge::ConciergeOptions;
use crate::models::User;

#[derive(Debug, Deserialize)]
pub struct ChatBody {
    pub task: String,
    /// Seconds before the turn defers or fails.
    pub timeout: Option<u64>,
    pub return_on_deferred: Option<bool>,
    pub model: Option<String>,
    pub reasoning_effort: Option<String>,
}

pub async fn chat(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Json(body): Json<ChatBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if body.task.trim().is_empty() {
        return Err(ApiError::validation("task must not be empty"));
    }

    let opts = ConciergeOptions {
        timeout: body
            .timeout
            .map(Duration::from_secs)
            .unwrap_or(state.config.concierge_timeout),
        return_on_deferred: body.return_on_deferred.unwrap_or(true),
        model: body.model,
        reasoning_effort: body.reasoning_effort,
    };

    let result = state
        .concierge
        .run_concierge(user.id, &body.task, opts)
        .await?;

    Ok(Json(serde_json::json!({
        "course_id": result.course_id,
        "thread_id": result.thread_id,
        "status": result.status,
        "result": result.result,
        "error": result.error,
        "duration_ms": result.duration_ms,
        "stream_url": format!("/courses/{}/events", result.course_id),
    })))
}
