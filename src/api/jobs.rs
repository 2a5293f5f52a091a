//! Named-job triggering and scheduler reconciliation.

use axum::extract::{Path, State};
use axum::{Extension, Json};
use chrono::Utc;

use crate::api::{ApiError, AppState};
use crate::models::User;

/// Enqueue a registered job now, deduped on the current minute.
pub async fn trigger(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(job_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !user.is_admin() {
        return Err(ApiError::permission_denied());
    }
    let config = state
        .registry
        .get(&job_id)
        .ok_or_else(|| ApiError::not_found(format!("job {job_id}")))?;

    let outcome = state
        .queue
        .enqueue_minute_keyed(&job_id, serde_json::json!({}), Utc::now(), config.max_attempts)
        .await?;

    Ok(Json(serde_json::json!({
        "job_id": job_id,
        "entry_id": outcome.entry_id,
        "queued": outcome.newly_queued,
    })))
}

/// Refresh the job manifest and reconcile the scheduler: re-run backfill
/// and a tick so newly registered schedules take effect immediately.
pub async fn sync(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !user.is_admin() {
        return Err(ApiError::permission_denied());
    }

    let now = Utc::now();
    let backfilled = state.scheduler.backfill_missed(now).await?;
    let scheduled = state.scheduler.tick(now).await?;

    let jobs: Vec<serde_json::Value> = state
        .registry
        .all()
        .map(|j| {
            serde_json::json!({
                "job_id": j.job_id,
                "description": j.description,
                "schedule": j.schedule,
                "enabled": j.enabled,
                "required_secrets": j.required_secrets,
                "max_attempts": j.max_attempts,
            })
        })
        .collect();

    Ok(Json(serde_json::json!({
        "jobs": jobs,
        "backfilled": backfilled,
        "scheduled": scheduled,
    })))
}
