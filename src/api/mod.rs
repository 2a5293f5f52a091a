//! HTTP API gateway: JSON endpoints, SSE streams, and the runner
//! WebSocket route, all over one axum router.

pub mod auth;
mod concierge;
mod courses;
mod error;
mod fiches;
mod internal;
mod jobs;
mod runners;
mod sse;
mod threads;
mod triggers;

pub use error::ApiError;

use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{any, get, post};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::concierge::{BarrierManager, ConciergeService};
use crate::config::Config;
use crate::db::Database;
use crate::events::{CourseEventLog, EventBus};
use crate::queue::{JobQueue, JobRegistry, Scheduler};
use crate::transport::{RunnerConnectionManager, RunnerJobDispatcher, WorkerOutputBuffer};

/// Webhook bodies larger than this are rejected with 413.
pub const TRIGGER_BODY_LIMIT: usize = 256 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Arc<dyn Database>,
    pub bus: Arc<EventBus>,
    pub log: Arc<CourseEventLog>,
    pub queue: Arc<JobQueue>,
    pub registry: Arc<JobRegistry>,
    pub scheduler: Arc<Scheduler>,
    pub concierge: Arc<ConciergeService>,
    pub barrier: Arc<BarrierManager>,
    pub connections: Arc<RunnerConnectionManager>,
    pub dispatcher: Arc<RunnerJobDispatcher>,
    pub output_buffer: Arc<WorkerOutputBuffer>,
}

/// Assemble the full router.
pub fn router(state: AppState) -> Router {
    let authed = Router::new()
        .route("/fiches", post(fiches::create).get(fiches::list))
        .route(
            "/fiches/{id}",
            get(fiches::get_one).put(fiches::update).delete(fiches::delete),
        )
        .route("/fiches/{id}/task", post(fiches::run_task))
        .route("/threads", get(threads::list))
        .route(
            "/threads/{id}",
            get(threads::get_one).put(threads::update).delete(threads::delete),
        )
        .route("/concierge/chat", post(concierge::chat))
        .route("/courses/{id}", get(courses::get_one))
        .route("/courses/{id}/events", get(courses::events))
        .route("/courses/{id}/cancel", post(courses::cancel))
        .route("/triggers", post(triggers::create))
        .route("/runners", post(runners::create).get(runners::list))
        .route("/jobs/{job_id}/trigger", post(jobs::trigger))
        .route("/sync", post(jobs::sync))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ));

    let internal = Router::new()
        .route("/internal/courses/{id}/continue", post(internal::continue_course))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth::internal_auth_middleware,
        ));

    let open = Router::new()
        .route(
            "/triggers/{id}/events",
            post(triggers::fire).layer(DefaultBodyLimit::max(TRIGGER_BODY_LIMIT)),
        )
        .route("/runners/ws", any(runners::ws))
        .route("/health", get(|| async { "ok" }));

    Router::new()
        .merge(authed)
        .merge(internal)
        .merge(open)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
