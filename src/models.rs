//! Domain rows and status enums shared across the platform.
//!
//! Every row type mirrors one table in the datastore. Status enums carry
//! their wire spelling via `Display`/`FromStr` so the database and the
//! event payloads always agree on the lowercase form.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Declares a lowercase wire enum with Display/FromStr in one place.
macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self {
                    $(Self::$variant => write!(f, $text)),+
                }
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!("unknown {} value: {other}", stringify!($name))),
                }
            }
        }
    };
}

wire_enum! {
    /// Role a user holds across the installation.
    UserRole {
        User => "user",
        Admin => "admin",
    }
}

wire_enum! {
    /// Coarse fiche lifecycle state shown in listings.
    FicheStatus {
        Idle => "idle",
        Running => "running",
        Error => "error",
    }
}

wire_enum! {
    /// How a thread came to exist.
    ThreadKind {
        Manual => "manual",
        Schedule => "schedule",
        Workflow => "workflow",
        Concierge => "concierge",
        Commis => "commis",
    }
}

wire_enum! {
    /// Conversation role of a thread message.
    MessageRole {
        System => "system",
        User => "user",
        Assistant => "assistant",
        Tool => "tool",
    }
}

wire_enum! {
    /// Lifecycle of a course (one execution of a fiche over a thread).
    ///
    /// Monotone except the deferred->running edge taken on continuation.
    CourseStatus {
        Queued => "queued",
        Running => "running",
        Success => "success",
        Failed => "failed",
        Deferred => "deferred",
    }
}

wire_enum! {
    /// What started a course.
    CourseTrigger {
        Manual => "manual",
        Schedule => "schedule",
        Api => "api",
        Webhook => "webhook",
        Continuation => "continuation",
    }
}

wire_enum! {
    /// Lifecycle of a commis job spawned by a concierge tool call.
    CommisStatus {
        Created => "created",
        Queued => "queued",
        Running => "running",
        Success => "success",
        Failed => "failed",
        Cancelled => "cancelled",
    }
}

wire_enum! {
    /// Connection state of a remote runner.
    RunnerStatus {
        Online => "online",
        Offline => "offline",
    }
}

wire_enum! {
    /// Lifecycle of a single exec dispatched to a runner.
    RunnerJobStatus {
        Pending => "pending",
        Running => "running",
        Success => "success",
        Failed => "failed",
        Timeout => "timeout",
    }
}

wire_enum! {
    /// Lifecycle of a durable queue entry.
    QueueStatus {
        Pending => "pending",
        Running => "running",
        Success => "success",
        Failure => "failure",
        Dead => "dead",
    }
}

wire_enum! {
    /// Kind of trigger attached to a fiche.
    TriggerKind {
        Webhook => "webhook",
        Schedule => "schedule",
    }
}

/// A platform user. Owns every row it creates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub role: UserRole,
    /// OAuth provider binding, when the account came from one.
    pub provider: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }
}

/// A configured agent: instructions, model, tool allowlist, schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fiche {
    pub id: i64,
    pub owner_id: i64,
    pub name: String,
    pub system_instructions: String,
    pub task_instructions: String,
    pub model: String,
    pub reasoning_effort: Option<String>,
    /// Tool names this fiche may call. `["*"]` expands to the full registry.
    pub allowed_tools: Vec<String>,
    pub config: serde_json::Value,
    /// Optional cron expression; scheduled fiches get a course per fire.
    pub schedule: Option<String>,
    pub status: FicheStatus,
    pub is_concierge: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// New-fiche parameters; the datastore assigns id/timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewFiche {
    pub owner_id: i64,
    pub name: String,
    pub system_instructions: String,
    pub task_instructions: String,
    pub model: String,
    pub reasoning_effort: Option<String>,
    pub allowed_tools: Vec<String>,
    pub config: serde_json::Value,
    pub schedule: Option<String>,
    pub is_concierge: bool,
}

impl NewFiche {
    /// Minimal fiche with sane defaults, used by services and tests.
    pub fn basic(owner_id: i64, name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            owner_id,
            name: name.into(),
            system_instructions: String::new(),
            task_instructions: String::new(),
            model: model.into(),
            reasoning_effort: None,
            allowed_tools: vec!["*".to_string()],
            config: serde_json::Value::Object(Default::default()),
            schedule: None,
            is_concierge: false,
        }
    }
}

/// A conversation bound to one fiche. The fiche never changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: i64,
    pub fiche_id: i64,
    pub owner_id: i64,
    pub title: String,
    pub kind: ThreadKind,
    /// Checkpoint handle blob managed by the checkpointer.
    pub fiche_state: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One call requested by an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub args: serde_json::Value,
}

/// A message within a thread. Insertion order is conversation order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadMessage {
    pub id: i64,
    pub thread_id: i64,
    pub role: MessageRole,
    pub content: String,
    /// Stable UUID carried by assistant messages so token-stream and
    /// completion events correlate.
    pub message_uuid: Option<Uuid>,
    pub tool_calls: Vec<ToolCallRecord>,
    /// Id of the tool call a tool-role message answers.
    pub tool_call_id: Option<String>,
    /// Whether a fiche run has already consumed this message as input.
    pub processed: bool,
    pub created_at: DateTime<Utc>,
}

/// New-message parameters.
#[derive(Debug, Clone)]
pub struct NewThreadMessage {
    pub thread_id: i64,
    pub role: MessageRole,
    pub content: String,
    pub message_uuid: Option<Uuid>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub tool_call_id: Option<String>,
    pub processed: bool,
}

impl NewThreadMessage {
    pub fn user(thread_id: i64, content: impl Into<String>) -> Self {
        Self {
            thread_id,
            role: MessageRole::User,
            content: content.into(),
            message_uuid: None,
            tool_calls: Vec::new(),
            tool_call_id: None,
            processed: false,
        }
    }

    pub fn assistant(thread_id: i64, content: impl Into<String>, message_uuid: Uuid) -> Self {
        Self {
            thread_id,
            role: MessageRole::Assistant,
            content: content.into(),
            message_uuid: Some(message_uuid),
            tool_calls: Vec::new(),
            tool_call_id: None,
            processed: true,
        }
    }

    pub fn tool(thread_id: i64, content: impl Into<String>, tool_call_id: Option<String>) -> Self {
        Self {
            thread_id,
            role: MessageRole::Tool,
            content: content.into(),
            message_uuid: None,
            tool_calls: Vec::new(),
            tool_call_id,
            processed: false,
        }
    }
}

/// One execution of a fiche on a thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Course {
    pub id: i64,
    pub fiche_id: i64,
    pub thread_id: i64,
    pub status: CourseStatus,
    pub trigger: CourseTrigger,
    /// Propagated into all child work (commis, runner jobs, events).
    pub trace_id: Uuid,
    /// Back-pointer forming the continuation chain. Unique when set.
    pub continuation_of_course_id: Option<i64>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub total_tokens: Option<i64>,
    pub total_cost_usd: Option<Decimal>,
    pub summary: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Per-course monotonically numbered event record, kept for SSE replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourseEvent {
    pub id: i64,
    pub course_id: i64,
    /// Strictly increasing within the course, starting at 1.
    pub seq: i64,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A subordinate work item spawned by a concierge tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommisJob {
    pub id: i64,
    pub owner_id: i64,
    /// Parent concierge course this job reports back to.
    pub concierge_course_id: i64,
    pub task: String,
    pub model: String,
    pub status: CommisStatus,
    /// String key used by the worker fleet and output buffer.
    pub commis_id: String,
    /// Inherited from the concierge turn that spawned the job.
    pub trace_id: Uuid,
    pub execution_mode: String,
    pub git_repo: Option<String>,
    pub result_summary: Option<String>,
    pub artifacts_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Join point for a deferred concierge: the set of commis still outstanding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommisBarrier {
    pub course_id: i64,
    pub job_ids: Vec<i64>,
    pub created_at: DateTime<Utc>,
}

/// A registered remote executor reachable over the WebSocket control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Runner {
    pub id: i64,
    pub owner_id: i64,
    pub name: String,
    /// SHA-256 hex of the runner's auth secret. Never the secret itself.
    #[serde(skip_serializing)]
    pub auth_secret_hash: String,
    pub status: RunnerStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// One shell exec dispatched to a runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerJob {
    pub id: Uuid,
    pub runner_id: i64,
    pub owner_id: i64,
    pub command: String,
    pub timeout_secs: i64,
    pub status: RunnerJobStatus,
    pub stdout_tail: String,
    pub stderr_tail: String,
    pub exit_code: Option<i32>,
    /// Correlation back to the commis worker that asked for the exec.
    pub worker_id: Option<String>,
    pub course_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// A durable queue entry. `(job_id, dedupe_key)` is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: i64,
    /// Registry key naming the handler.
    pub job_id: String,
    pub payload: serde_json::Value,
    pub scheduled_for: DateTime<Utc>,
    pub dedupe_key: String,
    pub status: QueueStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// A webhook or schedule trigger attached to a fiche.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerRow {
    pub id: i64,
    pub fiche_id: i64,
    pub kind: TriggerKind,
    /// SHA-256 hex of the bearer secret presented by callers.
    #[serde(skip_serializing)]
    pub secret_hash: String,
    pub created_at: DateTime<Utc>,
}

/// A hashed per-device token used by agent-ingest endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceToken {
    pub id: i64,
    pub owner_id: i64,
    pub device_id: String,
    #[serde(skip_serializing)]
    pub token_hash: String,
    pub created_at: DateTime<Utc>,
}

/// A stored workflow: a DAG of nodes compiled into sequential fiche runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: i64,
    pub owner_id: i64,
    pub name: String,
    pub nodes: Vec<WorkflowNode>,
    pub created_at: DateTime<Utc>,
}

/// One node in a workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowNode {
    Trigger { name: String },
    Fiche { fiche_id: i64 },
    Tool { name: String, args: serde_json::Value },
}

/// Truncate text for previews; full payloads live only in the course log.
pub fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{}…", cut.trim_end())
}
