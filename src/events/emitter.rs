//! Tool-event emitters with identity baked in at construction.
//!
//! The emitter knows whether it speaks for the concierge or for a commis,
//! so it always produces the correct event family no matter which task it
//! runs on. It never holds a database session; every durable emission goes
//! through the course event log, which opens its own short-lived
//! connection. Emission failures are logged and swallowed; observability
//! must not fail the run.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::events::{CourseEventLog, EventType};
use crate::models::preview;

const ARGS_PREVIEW_CHARS: usize = 200;
const RESULT_PREVIEW_CHARS: usize = 500;
const RESULT_RAW_CHARS: usize = 2000;
const ERROR_CHARS: usize = 500;

/// Which event family the emitter produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitterIdentity {
    Concierge,
    Commis,
}

impl EmitterIdentity {
    fn tool_started(self) -> EventType {
        match self {
            EmitterIdentity::Concierge => EventType::ConciergeToolStarted,
            EmitterIdentity::Commis => EventType::CommisToolStarted,
        }
    }

    fn tool_completed(self) -> EventType {
        match self {
            EmitterIdentity::Concierge => EventType::ConciergeToolCompleted,
            EmitterIdentity::Commis => EventType::CommisToolCompleted,
        }
    }

    fn tool_failed(self) -> EventType {
        match self {
            EmitterIdentity::Concierge => EventType::ConciergeToolFailed,
            EmitterIdentity::Commis => EventType::CommisToolFailed,
        }
    }
}

/// Emits tool lifecycle events onto one course's stream.
///
/// `course_id` is the stream the events land on. For a continuation or a
/// commis this is the originating concierge course, so subscribers watch a
/// single stream across the whole deferred/resumed turn.
#[derive(Clone)]
pub struct Emitter {
    identity: EmitterIdentity,
    log: Arc<CourseEventLog>,
    pub course_id: i64,
    pub owner_id: i64,
    /// Stable UUID for the assistant message under construction.
    pub message_id: Uuid,
    pub trace_id: Uuid,
}

impl Emitter {
    pub fn concierge(
        log: Arc<CourseEventLog>,
        course_id: i64,
        owner_id: i64,
        message_id: Uuid,
        trace_id: Uuid,
    ) -> Self {
        Self {
            identity: EmitterIdentity::Concierge,
            log,
            course_id,
            owner_id,
            message_id,
            trace_id,
        }
    }

    pub fn commis(
        log: Arc<CourseEventLog>,
        course_id: i64,
        owner_id: i64,
        message_id: Uuid,
        trace_id: Uuid,
    ) -> Self {
        Self {
            identity: EmitterIdentity::Commis,
            log,
            course_id,
            owner_id,
            message_id,
            trace_id,
        }
    }

    pub fn is_concierge(&self) -> bool {
        self.identity == EmitterIdentity::Concierge
    }

    pub fn is_commis(&self) -> bool {
        self.identity == EmitterIdentity::Commis
    }

    pub fn log(&self) -> &Arc<CourseEventLog> {
        &self.log
    }

    pub async fn emit_tool_started(
        &self,
        tool_name: &str,
        tool_call_id: &str,
        tool_args: &serde_json::Value,
    ) {
        let args_text = tool_args.to_string();
        let payload = serde_json::json!({
            "owner_id": self.owner_id,
            "tool_name": tool_name,
            "tool_call_id": tool_call_id,
            "tool_args_preview": preview(&args_text, ARGS_PREVIEW_CHARS),
            "tool_args": tool_args,
            "trace_id": self.trace_id,
            "timestamp": Utc::now(),
        });
        if let Err(e) = self
            .log
            .append(self.course_id, self.identity.tool_started(), payload)
            .await
        {
            tracing::warn!(course_id = self.course_id, "failed to emit tool_started: {}", e);
        }
    }

    /// String results are truncated and wrapped as `{"raw": …}`; structured
    /// results (e.g. spawn_commis returning `{job_id}`) pass through.
    pub async fn emit_tool_completed(
        &self,
        tool_name: &str,
        tool_call_id: &str,
        duration_ms: i64,
        result: &serde_json::Value,
    ) {
        let (result_preview, result_payload) = match result {
            serde_json::Value::String(text) => (
                preview(text, RESULT_PREVIEW_CHARS),
                serde_json::json!({"raw": preview(text, RESULT_RAW_CHARS)}),
            ),
            other => (preview(&other.to_string(), RESULT_PREVIEW_CHARS), other.clone()),
        };
        let payload = serde_json::json!({
            "owner_id": self.owner_id,
            "tool_name": tool_name,
            "tool_call_id": tool_call_id,
            "duration_ms": duration_ms,
            "result_preview": result_preview,
            "result": result_payload,
            "trace_id": self.trace_id,
            "timestamp": Utc::now(),
        });
        if let Err(e) = self
            .log
            .append(self.course_id, self.identity.tool_completed(), payload)
            .await
        {
            tracing::warn!(course_id = self.course_id, "failed to emit tool_completed: {}", e);
        }
    }

    pub async fn emit_tool_failed(
        &self,
        tool_name: &str,
        tool_call_id: &str,
        duration_ms: i64,
        error: &str,
    ) {
        let payload = serde_json::json!({
            "owner_id": self.owner_id,
            "tool_name": tool_name,
            "tool_call_id": tool_call_id,
            "duration_ms": duration_ms,
            "error": preview(error, ERROR_CHARS),
            "error_details": {"raw_error": error},
            "trace_id": self.trace_id,
            "timestamp": Utc::now(),
        });
        if let Err(e) = self
            .log
            .append(self.course_id, self.identity.tool_failed(), payload)
            .await
        {
            tracing::warn!(course_id = self.course_id, "failed to emit tool_failed: {}", e);
        }
    }

    /// Bus-only liveness signal while a long LLM call is in flight.
    pub async fn emit_heartbeat(&self, activity: &str, phase: &str) {
        self.log
            .bus()
            .publish(
                EventType::ConciergeHeartbeat,
                serde_json::json!({
                    "event_type": EventType::ConciergeHeartbeat.as_str(),
                    "course_id": self.course_id,
                    "owner_id": self.owner_id,
                    "activity": activity,
                    "phase": phase,
                    "timestamp": Utc::now(),
                }),
            )
            .await;
        tracing::debug!(course_id = self.course_id, phase = phase, "emitted heartbeat");
    }

    /// Bus-only token event for streaming clients, keyed by the stable
    /// assistant message UUID.
    pub async fn emit_token(&self, token: &str) {
        self.log
            .bus()
            .publish(
                EventType::ConciergeToken,
                serde_json::json!({
                    "event_type": EventType::ConciergeToken.as_str(),
                    "course_id": self.course_id,
                    "message_id": self.message_id,
                    "token": token,
                }),
            )
            .await;
    }
}
