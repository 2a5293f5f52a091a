//! Tools bridging fiches to the runner fleet.

use async_trait::async_trait;

use crate::context::ExecutionContext;
use crate::db::Database;
use crate::tools::{Tool, ToolError, ToolOutput};

const DEFAULT_TIMEOUT_SECS: i64 = 60;
const MAX_TIMEOUT_SECS: i64 = 3600;

/// Runs a shell command on a registered remote runner.
pub struct RunnerExecTool;

#[async_trait]
impl Tool for RunnerExecTool {
    fn name(&self) -> &str {
        "runner_exec"
    }

    fn description(&self) -> &str {
        "Execute a shell command on a remote runner and return its output. \
         The runner must be online; one command runs at a time per runner."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "runner_id": {"type": "integer", "description": "Id of the target runner"},
                "command": {"type": "string", "description": "Shell command to run"},
                "timeout_secs": {
                    "type": "integer",
                    "description": "Max execution time in seconds",
                    "default": DEFAULT_TIMEOUT_SECS
                }
            },
            "required": ["runner_id", "command"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ExecutionContext,
    ) -> Result<ToolOutput, ToolError> {
        let runner_id = params
            .get("runner_id")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| ToolError::InvalidParameters("missing 'runner_id'".to_string()))?;
        let command = params
            .get("command")
            .and_then(|v| v.as_str())
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| ToolError::InvalidParameters("missing 'command'".to_string()))?;
        let timeout_secs = params
            .get("timeout_secs")
            .and_then(|v| v.as_i64())
            .unwrap_or(DEFAULT_TIMEOUT_SECS)
            .clamp(1, MAX_TIMEOUT_SECS);

        let dispatcher = ctx.dispatcher.as_ref().ok_or_else(|| {
            ToolError::MissingContext("runner dispatch is not available in this run".to_string())
        })?;

        // Ownership check happens here; the dispatcher trusts its caller.
        let runner = ctx
            .db
            .get_runner(runner_id)
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?
            .ok_or_else(|| ToolError::NotFound(format!("runner {runner_id}")))?;
        if runner.owner_id != ctx.owner_id {
            return Err(ToolError::NotAuthorized(format!(
                "runner {runner_id} belongs to another owner"
            )));
        }

        let course_id = ctx.concierge.as_ref().map(|scope| scope.course_id);
        let envelope = dispatcher
            .dispatch_job(
                ctx.owner_id,
                runner_id,
                command,
                timeout_secs,
                ctx.worker_id.clone(),
                course_id,
            )
            .await;

        Ok(ToolOutput::value(envelope))
    }
}

/// Peeks at the live output tail of a commis worker.
pub struct PeekWorkerOutputTool;

#[async_trait]
impl Tool for PeekWorkerOutputTool {
    fn name(&self) -> &str {
        "peek_worker_output"
    }

    fn description(&self) -> &str {
        "Read the recent live output of a commis worker without waiting for it to finish."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "worker_id": {"type": "string", "description": "Commis worker id"},
                "max_bytes": {"type": "integer", "description": "Tail size cap"}
            },
            "required": ["worker_id"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ExecutionContext,
    ) -> Result<ToolOutput, ToolError> {
        let worker_id = params
            .get("worker_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidParameters("missing 'worker_id'".to_string()))?;
        let max_bytes = params
            .get("max_bytes")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize);

        let buffer = ctx.output_buffer.as_ref().ok_or_else(|| {
            ToolError::MissingContext("worker output buffer is not available".to_string())
        })?;

        if let Some(meta) = buffer.get_meta(worker_id) {
            if meta.owner_id.is_some_and(|owner| owner != ctx.owner_id) {
                return Err(ToolError::NotAuthorized(
                    "worker output belongs to another owner".to_string(),
                ));
            }
        }

        let tail = buffer.get_tail(worker_id, max_bytes);
        Ok(ToolOutput::value(serde_json::json!({
            "worker_id": worker_id,
            "output": tail,
            "empty": tail.is_empty(),
        })))
    }
}
