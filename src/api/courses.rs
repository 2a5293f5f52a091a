//! Course inspection, SSE streaming, and cancellation.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use serde::Deserialize;

use crate::api::auth::require_owner;
use crate::api::{ApiError, AppState, sse};
use crate::db::Database;
use crate::models::{Course, User};

async fn owned_course(state: &AppState, user: &User, id: i64) -> Result<Course, ApiError> {
    let course = state
        .db
        .get_course(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("course {id}")))?;
    let fiche = state
        .db
        .get_fiche(course.fiche_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("fiche {}", course.fiche_id)))?;
    require_owner(user, fiche.owner_id)?;
    Ok(course)
}

pub async fn get_one(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(id): Path<i64>,
) -> Result<Json<Course>, ApiError> {
    Ok(Json(owned_course(&state, &user, id).await?))
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub last_event_id: Option<i64>,
}

/// SSE stream of course events with Last-Event-ID resumption. The header
/// wins over the query parameter, matching browser reconnect behavior.
pub async fn events(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(id): Path<i64>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    owned_course(&state, &user, id).await?;

    let after_seq = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())
        .or(query.last_event_id)
        .unwrap_or(0);

    Ok(sse::course_stream(&state.log, id, after_seq).await?)
}

/// Cancel a non-terminal course; cascades to outstanding commis.
pub async fn cancel(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    owned_course(&state, &user, id).await?;
    let cancelled = state.concierge.cancel_course(&state.barrier, id).await?;
    if !cancelled {
        return Err(ApiError::invalid_state("course already finished"));
    }
    Ok(Json(serde_json::json!({"cancelled": true, "course_id": id})))
}
