//! Tool trait and the error-envelope contract.
//!
//! Every tool returns either a result value or a `ToolError`. The runner
//! converts errors into the `{ok:false, error_type, user_message, details}`
//! envelope and hands it back to the LLM as a tool message, recoverable by
//! construction. Only infrastructure failures (database, transport) leave
//! this layer as Rust errors.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::ExecutionContext;
use crate::error::ErrorKind;

/// Error type for tool execution.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    #[error("Rate limited, retry after {0:?}")]
    RateLimited(Option<Duration>),

    #[error("External service error: {0}")]
    ExternalService(String),

    #[error("Missing context: {0}")]
    MissingContext(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl ToolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ToolError::InvalidParameters(_) => ErrorKind::ValidationError,
            ToolError::ExecutionFailed(_)
            | ToolError::Timeout(_)
            | ToolError::ExternalService(_) => ErrorKind::ExecutionError,
            ToolError::NotAuthorized(_) => ErrorKind::PermissionDenied,
            ToolError::RateLimited(_) => ErrorKind::RateLimited,
            ToolError::MissingContext(_) => ErrorKind::MissingContext,
            ToolError::NotFound(_) => ErrorKind::NotFound,
            ToolError::InvalidState(_) => ErrorKind::InvalidState,
        }
    }

    /// The envelope handed to the LLM in place of a result.
    pub fn to_envelope(&self) -> serde_json::Value {
        envelope_error(self.kind(), &self.to_string(), serde_json::Value::Null)
    }
}

impl From<std::io::Error> for ToolError {
    fn from(err: std::io::Error) -> Self {
        ToolError::ExecutionFailed(err.to_string())
    }
}

/// Suspension raised out of a tool: the run must pause until the listed
/// commis jobs report back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interrupt {
    /// Discriminator; commis spawns use `commiss_pending`.
    pub kind: String,
    pub job_ids: Vec<i64>,
    /// Job summaries for the deferred event payload.
    pub created_jobs: Vec<serde_json::Value>,
}

impl Interrupt {
    pub fn commiss_pending(job_ids: Vec<i64>, created_jobs: Vec<serde_json::Value>) -> Self {
        Self {
            kind: "commiss_pending".to_string(),
            job_ids,
            created_jobs,
        }
    }
}

/// Output from a tool execution.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// The result data returned to the LLM.
    pub result: serde_json::Value,
    /// Set when the tool requires the run to suspend after this dispatch.
    pub interrupt: Option<Interrupt>,
}

impl ToolOutput {
    pub fn value(result: serde_json::Value) -> Self {
        Self {
            result,
            interrupt: None,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::value(serde_json::Value::String(text.into()))
    }

    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = Some(interrupt);
        self
    }
}

/// Success envelope.
pub fn envelope_ok(data: serde_json::Value) -> serde_json::Value {
    serde_json::json!({"ok": true, "data": data})
}

/// Failure envelope in the shape every error handler speaks.
pub fn envelope_error(
    kind: ErrorKind,
    user_message: &str,
    details: serde_json::Value,
) -> serde_json::Value {
    serde_json::json!({
        "ok": false,
        "error_type": kind.as_str(),
        "user_message": user_message,
        "details": details,
    })
}

/// Whether a value is a failure envelope.
pub fn envelope_is_error(value: &serde_json::Value) -> bool {
    value.get("ok").and_then(|v| v.as_bool()) == Some(false)
}

/// Whether a value is a failure envelope whose kind downstream summarizers
/// must never report as success.
pub fn envelope_is_critical(value: &serde_json::Value) -> bool {
    if !envelope_is_error(value) {
        return false;
    }
    value
        .get("error_type")
        .and_then(|v| v.as_str())
        .and_then(|s| serde_json::from_value::<ErrorKind>(serde_json::json!(s)).ok())
        .is_some_and(ErrorKind::is_critical)
}

/// Trait for tools the fiche runner can dispatch.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema for the tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ExecutionContext,
    ) -> Result<ToolOutput, ToolError>;

    fn definition(&self) -> crate::llm::ToolDefinition {
        crate::llm::ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trip() {
        let err = envelope_error(ErrorKind::NotFound, "no such runner", serde_json::Value::Null);
        assert!(envelope_is_error(&err));
        assert!(envelope_is_critical(&err));
        assert_eq!(err["error_type"], "not_found");

        let ok = envelope_ok(serde_json::json!({"n": 1}));
        assert!(!envelope_is_error(&ok));
        assert!(!envelope_is_critical(&ok));
    }

    #[test]
    fn only_critical_kinds_flag_critical() {
        for kind in [
            ErrorKind::MissingContext,
            ErrorKind::NotFound,
            ErrorKind::InvalidState,
        ] {
            assert!(envelope_is_critical(&envelope_error(kind, "x", serde_json::Value::Null)));
        }
        for kind in [
            ErrorKind::ValidationError,
            ErrorKind::ExecutionError,
            ErrorKind::RateLimited,
            ErrorKind::PermissionDenied,
        ] {
            assert!(!envelope_is_critical(&envelope_error(kind, "x", serde_json::Value::Null)));
        }
    }

    #[test]
    fn tool_error_maps_to_taxonomy() {
        assert_eq!(
            ToolError::MissingContext("creds".to_string()).kind(),
            ErrorKind::MissingContext
        );
        assert_eq!(
            ToolError::InvalidParameters("bad".to_string()).kind(),
            ErrorKind::ValidationError
        );
        let envelope = ToolError::ExecutionFailed("boom".to_string()).to_envelope();
        assert_eq!(envelope["error_type"], "execution_error");
        assert!(envelope["user_message"].as_str().unwrap().contains("boom"));
    }
}
