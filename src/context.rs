//! Request-scoped execution context.
//!
//! Everything that was ambient in older designs (credentials, emitter,
//! concierge correlation) is carried explicitly on this value and threaded
//! through the runner into tool execution. Nothing here is a process
//! global; a context lives for one fiche run.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::credentials::CredentialResolver;
use crate::db::Database;
use crate::events::Emitter;
use crate::transport::{RunnerJobDispatcher, WorkerOutputBuffer};

/// Correlation data for the concierge turn currently executing, inherited
/// by any commis spawned during the turn.
#[derive(Debug, Clone)]
pub struct ConciergeScope {
    pub course_id: i64,
    pub trace_id: Uuid,
    pub model: String,
    pub reasoning_effort: Option<String>,
}

/// Per-run context handed to the fiche runner and every tool it dispatches.
#[derive(Clone)]
pub struct ExecutionContext {
    pub db: Arc<dyn Database>,
    pub owner_id: i64,
    /// Absent when no credential source was set up for this run; tools
    /// requiring one return a `missing_context` envelope.
    pub credentials: Option<Arc<dyn CredentialResolver>>,
    /// Active emitter; tool events route through it.
    pub emitter: Option<Emitter>,
    /// Set only while a concierge turn is driving the run.
    pub concierge: Option<ConciergeScope>,
    /// Cooperative cancellation, polled between tool dispatches.
    pub cancel: CancellationToken,
    /// Runner fleet access for exec tools.
    pub dispatcher: Option<Arc<RunnerJobDispatcher>>,
    pub output_buffer: Option<Arc<WorkerOutputBuffer>>,
    /// Commis worker identity when this run executes inside a commis.
    pub worker_id: Option<String>,
}

impl ExecutionContext {
    pub fn new(db: Arc<dyn Database>, owner_id: i64) -> Self {
        Self {
            db,
            owner_id,
            credentials: None,
            emitter: None,
            concierge: None,
            cancel: CancellationToken::new(),
            dispatcher: None,
            output_buffer: None,
            worker_id: None,
        }
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialResolver>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_emitter(mut self, emitter: Emitter) -> Self {
        self.emitter = Some(emitter);
        self
    }

    pub fn with_concierge(mut self, scope: ConciergeScope) -> Self {
        self.concierge = Some(scope);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<RunnerJobDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn with_output_buffer(mut self, buffer: Arc<WorkerOutputBuffer>) -> Self {
        self.output_buffer = Some(buffer);
        self
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    /// Trace id for this run: the concierge's when inside a turn.
    pub fn trace_id(&self) -> Option<Uuid> {
        self.concierge.as_ref().map(|c| c.trace_id)
    }
}
