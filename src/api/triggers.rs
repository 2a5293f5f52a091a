//! Trigger creation and webhook firing.
//!
//! Firing is bearer-authenticated against the trigger's stored secret
//! hash (constant time), accepts JSON bodies up to the configured limit,
//! publishes TRIGGER_FIRED and enqueues one course per fire; no dedup at
//! this layer.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::{Extension, Json};
use serde::Deserialize;
use uuid::Uuid;

use crate::api::auth::require_owner;
use crate::api::{ApiError, AppState};
use crate::db::Database;
use crate::events::EventType;
use crate::jobs::{FICHE_RUN_JOB_ID, course_dedupe_key};
use crate::models::{CourseStatus, CourseTrigger, NewThreadMessage, ThreadKind, TriggerKind, User};
use crate::transport::ws::{generate_secret, hash_secret, verify_secret};

#[derive(Debug, Deserialize)]
pub struct CreateTriggerBody {
    pub fiche_id: i64,
    pub kind: TriggerKind,
}

/// Create a trigger. The bearer secret is returned exactly once.
pub async fn create(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Json(body): Json<CreateTriggerBody>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let fiche = state
        .db
        .get_fiche(body.fiche_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("fiche {}", body.fiche_id)))?;
    require_owner(&user, fiche.owner_id)?;

    let secret = generate_secret();
    let trigger = state
        .db
        .create_trigger(fiche.id, body.kind, &hash_secret(&secret))
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "id": trigger.id,
            "fiche_id": trigger.fiche_id,
            "kind": trigger.kind,
            "secret": secret,
        })),
    ))
}

/// Fire a webhook trigger. 202 on accept; 404 covers both unknown ids and
/// bad secrets so probes learn nothing.
pub async fn fire(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let trigger = state
        .db
        .get_trigger(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("trigger {id}")))?;

    let presented = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::not_found(format!("trigger {id}")))?;
    if !verify_secret(presented, &trigger.secret_hash) {
        return Err(ApiError::not_found(format!("trigger {id}")));
    }

    let payload: serde_json::Value = if body.is_empty() {
        serde_json::json!({})
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::validation(format!("body is not valid JSON: {e}")))?
    };

    let fiche = state
        .db
        .get_fiche(trigger.fiche_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("fiche {}", trigger.fiche_id)))?;

    // One fresh course per fire.
    let thread = state
        .db
        .create_thread(fiche.id, fiche.owner_id, &fiche.name, ThreadKind::Manual)
        .await?;
    state
        .db
        .append_message(&NewThreadMessage::user(
            thread.id,
            format!("Webhook event:\n{payload}"),
        ))
        .await?;
    let course = state
        .db
        .create_course(
            fiche.id,
            thread.id,
            CourseTrigger::Webhook,
            CourseStatus::Queued,
            Uuid::new_v4(),
        )
        .await?;
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

    state
        .bus
        .publish(
            EventType::TriggerFired,
            serde_json::json!({
                "event_type": EventType::TriggerFired.as_str(),
                "trigger_id": trigger.id,
                "fiche_id": fiche.id,
                "course_id": course.id,
                "payload": payload,
                "trigger_type": trigger.kind,
            }),
        )
        .await;

    Ok(StatusCode::ACCEPTED)
}
