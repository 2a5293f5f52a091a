//! Thread listing and management. Ownership-enforced; admins exempt.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::Deserialize;

use crate::api::auth::{listing_scope, require_owner};
use crate::api::{ApiError, AppState};
use crate::db::Database;
use crate::models::{Thread, ThreadMessage, User};

pub async fn list(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
) -> Result<Json<Vec<Thread>>, ApiError> {
    Ok(Json(state.db.list_threads(listing_scope(&user)).await?))
}

async fn owned_thread(state: &AppState, user: &User, id: i64) -> Result<Thread, ApiError> {
    let thread = state
        .db
        .get_thread(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("thread {id}")))?;
    require_owner(user, thread.owner_id)?;
    Ok(thread)
}

#[derive(serde::Serialize)]
pub struct ThreadDetail {
    #[serde(flatten)]
    pub thread: Thread,
    pub messages: Vec<ThreadMessage>,
}

pub async fn get_one(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(id): Path<i64>,
) -> Result<Json<ThreadDetail>, ApiError> {
    let thread = owned_thread(&state, &user, id).await?;
    let messages = state.db.list_messages(id).await?;
    Ok(Json(ThreadDetail { thread, messages }))
}

#[derive(Debug, Deserialize)]
pub struct UpdateThreadBody {
    pub title: String,
}

pub async fn update(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(id): Path<i64>,
    Json(body): Json<UpdateThreadBody>,
) -> Result<Json<Thread>, ApiError> {
    owned_thread(&state, &user, id).await?;
    if body.title.trim().is_empty() {
        return Err(ApiError::validation("title must not be empty"));
    }
    state.db.update_thread_title(id, &body.title).await?;
    let thread = state
        .db
        .get_thread(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("thread {id}")))?;
    Ok(Json(thread))
}

pub async fn delete(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    owned_thread(&state, &user, id).await?;
    state.db.delete_thread(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
