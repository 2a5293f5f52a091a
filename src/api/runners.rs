//! Runner registration and the WebSocket control-channel route.

use axum::extract::{State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::Response;
use axum::{Extension, Json};
use serde::Deserialize;

use crate::api::auth::listing_scope;
use crate::api::{ApiError, AppState};
use crate::db::Database;
use crate::models::{Runner, User};
use crate::transport::ws::{RunnerSocketState, generate_secret, hash_secret, serve_socket};

#[derive(Debug, Deserialize)]
pub struct CreateRunnerBody {
    pub name: String,
}

/// Register a runner. The auth secret is returned exactly once; only its
/// hash is stored.
pub async fn create(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Json(body): Json<CreateRunnerBody>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    if body.name.trim().is_empty() {
        return Err(ApiError::validation("name must not be empty"));
    }
    let secret = generate_secret();
    let runner = state
        .db
        .create_runner(user.id, &body.name, &hash_secret(&secret))
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "id": runner.id,
            "name": runner.name,
            "status": runner.status,
            "secret": secret,
        })),
    ))
}

pub async fn list(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
) -> Result<Json<Vec<Runner>>, ApiError> {
    Ok(Json(state.db.list_runners(listing_scope(&user)).await?))
}

/// Upgrade to the runner control channel. Authentication happens on the
/// socket via the hello frame, not here.
pub async fn ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let socket_state = RunnerSocketState {
        db: std::sync::Arc::clone(&state.db),
        connections: std::sync::Arc::clone(&state.connections),
        dispatcher: std::sync::Arc::clone(&state.dispatcher),
        output_buffer: std::sync::Arc::clone(&state.output_buffer),
        bus: std::sync::Arc::clone(&state.bus),
    };
    ws.on_upgrade(move |socket| serve_socket(socket_state, socket))
}
