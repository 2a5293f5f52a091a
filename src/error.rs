//! Error types shared across the platform.
//!
//! Tool-level failures travel as structured envelopes back to the LLM
//! (recoverable); infrastructure failures propagate as these error enums
//! and mark the surrounding course failed.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The platform-wide error taxonomy. Every tool envelope and HTTP error
/// response names one of these kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationError,
    MissingContext,
    NotFound,
    InvalidState,
    PermissionDenied,
    RateLimited,
    ExecutionError,
    TransportException,
}

impl ErrorKind {
    /// Critical kinds that downstream summarizers must never report as
    /// success even when the tool call itself returned "normally".
    pub fn is_critical(self) -> bool {
        matches!(
            self,
            ErrorKind::MissingContext | ErrorKind::NotFound | ErrorKind::InvalidState
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::MissingContext => "missing_context",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::ExecutionError => "execution_error",
            ErrorKind::TransportException => "transport_exception",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Datastore failures. Always infrastructure-level, never an envelope.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("row not found: {0}")]
    NotFound(String),

    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("migration failed: {0}")]
    Migration(String),
}

impl DatabaseError {
    /// Classify a tokio-postgres error, surfacing unique violations so
    /// callers can use constraints as idempotency guards.
    pub fn from_pg(err: tokio_postgres::Error) -> Self {
        if let Some(db_err) = err.as_db_error() {
            if db_err.code() == &tokio_postgres::error::SqlState::UNIQUE_VIOLATION {
                return DatabaseError::UniqueViolation(db_err.message().to_string());
            }
        }
        DatabaseError::Query(err.to_string())
    }
}

/// LLM invocation failures (transport-level; the provider client itself is
/// external to this repo).
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm request failed ({provider}): {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("llm response malformed: {0}")]
    MalformedResponse(String),

    #[error("llm rate limited, retry after {0:?}")]
    RateLimited(Option<Duration>),

    #[error("script exhausted after {0} turns")]
    ScriptExhausted(usize),
}

/// Durable queue failures.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("unknown job id: {0}")]
    UnknownJob(String),

    #[error("missing required secrets: {0}")]
    MissingSecrets(String),

    #[error("job execution failed: {0}")]
    Execution(String),
}

/// Runner transport and dispatch failures.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("runner {0} is offline")]
    Offline(i64),

    #[error("runner {0} is busy with another job")]
    Busy(i64),

    #[error("failed to send to runner: {0}")]
    SendFailed(String),

    #[error("job timed out after {0} seconds")]
    Timeout(i64),

    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// Concierge/continuation orchestration failures.
#[derive(Debug, Error)]
pub enum ConciergeError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("course {0} not found")]
    CourseNotFound(i64),

    #[error("course {course_id} is not deferred (status: {status})")]
    NotDeferred { course_id: i64, status: String },

    #[error("fiche run failed: {0}")]
    Run(String),
}
