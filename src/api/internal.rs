//! Internal endpoints gated by the shared X-Internal-Token secret.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;

use crate::api::{ApiError, AppState};
use crate::db::Database;
use crate::models::CourseStatus;

/// Re-enter a deferred course: kicks its continuation if one exists, or
/// reports the conflict. Used by operators and the control plane, never by
/// end users.
pub async fn continue_course(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let course = state
        .db
        .get_course(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("course {id}")))?;

    if course.status != CourseStatus::Deferred {
        return Err(ApiError::invalid_state(format!(
            "course {id} is not deferred ({})",
            course.status
        )));
    }

    let continuation = state
        .db
        .find_continuation(id)
        .await?
        .ok_or_else(|| ApiError::invalid_state(format!("course {id} has no continuation yet")))?;

    let continuation_id = continuation.id;
    if continuation.status == CourseStatus::Queued {
        let concierge = std::sync::Arc::clone(&state.concierge);
        tokio::spawn(concierge.execute_continuation(continuation));
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"continuation_course_id": continuation_id})),
    ))
}
