//! Fiche CRUD and manual task runs.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::Deserialize;
use uuid::Uuid;

use crate::api::auth::{listing_scope, require_owner};
use crate::api::{ApiError, AppState};
use crate::db::Database;
use crate::jobs::{FICHE_RUN_JOB_ID, course_dedupe_key};
use crate::models::{
    CourseStatus, CourseTrigger, Fiche, FicheStatus, NewFiche, NewThreadMessage, ThreadKind, User,
};

#[derive(Debug, Deserialize)]
pub struct FicheBody {
    pub name: String,
    #[serde(default)]
    pub system_instructions: String,
    #[serde(default)]
    pub task_instructions: String,
    pub model: Option<String>,
    pub reasoning_effort: Option<String>,
    pub allowed_tools: Option<Vec<String>>,
    pub config: Option<serde_json::Value>,
    pub schedule: Option<String>,
}

fn validate_schedule(schedule: &Option<String>) -> Result<(), ApiError> {
    if let Some(expr) = schedule {
        crate::queue::registry::parse_cron(expr)
            .map_err(|e| ApiError::validation(e.to_string()))?;
    }
    Ok(())
}

pub async fn create(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Json(body): Json<FicheBody>,
) -> Result<(StatusCode, Json<Fiche>), ApiError> {
    if body.name.trim().is_empty() {
        return Err(ApiError::validation("name must not be empty"));
    }
    validate_schedule(&body.schedule)?;

    let fiche = state
        .db
        .create_fiche(&NewFiche {
            owner_id: user.id,
            name: body.name,
            system_instructions: body.system_instructions,
            task_instructions: body.task_instructions,
            model: body.model.unwrap_or_else(|| "gpt-4o-mini".to_string()),
            reasoning_effort: body.reasoning_effort,
            allowed_tools: body.allowed_tools.unwrap_or_else(|| vec!["*".to_string()]),
            config: body.config.unwrap_or_else(|| serde_json::json!({})),
            schedule: body.schedule,
            is_concierge: false,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(fiche)))
}

pub async fn list(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
) -> Result<Json<Vec<Fiche>>, ApiError> {
    Ok(Json(state.db.list_fiches(listing_scope(&user)).await?))
}

async fn owned_fiche(state: &AppState, user: &User, id: i64) -> Result<Fiche, ApiError> {
    let fiche = state
        .db
        .get_fiche(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("fiche {id}")))?;
    require_owner(user, fiche.owner_id)?;
    Ok(fiche)
}

pub async fn get_one(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(id): Path<i64>,
) -> Result<Json<Fiche>, ApiError> {
    Ok(Json(owned_fiche(&state, &user, id).await?))
}

pub async fn update(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(id): Path<i64>,
    Json(body): Json<FicheBody>,
) -> Result<Json<Fiche>, ApiError> {
    let mut fiche = owned_fiche(&state, &user, id).await?;
    validate_schedule(&body.schedule)?;

    fiche.name = body.name;
    fiche.system_instructions = body.system_instructions;
    fiche.task_instructions = body.task_instructions;
    if let Some(model) = body.model {
        fiche.model = model;
    }
    fiche.reasoning_effort = body.reasoning_effort;
    if let Some(tools) = body.allowed_tools {
        fiche.allowed_tools = tools;
    }
    if let Some(config) = body.config {
        fiche.config = config;
    }
    fiche.schedule = body.schedule;

    state.db.update_fiche(&fiche).await?;
    let updated = state
        .db
        .get_fiche(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("fiche {id}")))?;
    Ok(Json(updated))
}

pub async fn delete(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    owned_fiche(&state, &user, id).await?;
    state.db.delete_fiche(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct TaskBody {
    pub task: String,
}

/// Run a fiche once against a fresh thread. 409 while the fiche is busy.
pub async fn run_task(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Path(id): Path<i64>,
    Json(body): Json<TaskBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let fiche = owned_fiche(&state, &user, id).await?;
    if body.task.trim().is_empty() {
        return Err(ApiError::validation("task must not be empty"));
    }
    if fiche.status == FicheStatus::Running {
        return Err(ApiError::invalid_state("fiche is already running"));
    }

    let thread = state
        .db
        .create_thread(fiche.id, user.id, &body.task, ThreadKind::Manual)
        .await?;
    state
        .db
        .append_message(&NewThreadMessage::user(thread.id, body.task))
        .await?;
    let course = state
        .db
        .create_course(
            fiche.id,
            thread.id,
            CourseTrigger::Manual,
            CourseStatus::Queued,
            Uuid::new_v4(),
        )
        .await?;

    // Execution rides the durable queue like every other background run.
    state
        .queue
        .enqueue(
            FICHE_RUN_JOB_ID,
            serde_json::json!({"course_id": course.id}),
            chrono::Utc::now(),
            &course_dedupe_key(course.id),
            3,
        )
        .await?;

    Ok(Json(serde_json::json!({
        "thread_id": thread.id,
        "course_id": course.id,
    })))
}
