//! The spawn_commis tool: phase 1 of the two-phase spawn commit.
//!
//! Phase 1 runs inside the fiche runner, before the LLM is told the call
//! succeeded: validate, check the credential context, insert the job row
//! in status=created, then raise the interrupt. Phase 2 (barrier creation,
//! created->queued flip, course deferral) happens in the concierge service
//! when it catches the interrupt, so a crash between the phases leaves
//! only inert `created` rows behind, never a half-armed barrier.

use async_trait::async_trait;
use uuid::Uuid;

use crate::context::ExecutionContext;
use crate::db::{Database, NewCommisJob};
use crate::tools::{Interrupt, Tool, ToolError, ToolOutput};

pub struct SpawnCommisTool;

fn valid_git_repo(url: &str) -> bool {
    url.starts_with("https://") || url.starts_with("git@") || url.starts_with("ssh://")
}

#[async_trait]
impl Tool for SpawnCommisTool {
    fn name(&self) -> &str {
        "spawn_commis"
    }

    fn description(&self) -> &str {
        "Delegate a bounded task to an asynchronous commis worker. The current turn \
         pauses until every spawned commis reports back, then resumes with their results."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "What the commis should do, self-contained"
                },
                "execution_mode": {
                    "type": "string",
                    "enum": ["plain", "workspace"],
                    "default": "plain"
                },
                "git_repo": {
                    "type": "string",
                    "description": "Repository URL, required for workspace mode"
                }
            },
            "required": ["task"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ExecutionContext,
    ) -> Result<ToolOutput, ToolError> {
        let task = params
            .get("task")
            .and_then(|v| v.as_str())
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ToolError::InvalidParameters("missing 'task' parameter".to_string()))?;

        let execution_mode = params
            .get("execution_mode")
            .and_then(|v| v.as_str())
            .unwrap_or("plain");
        if !matches!(execution_mode, "plain" | "workspace") {
            return Err(ToolError::InvalidParameters(format!(
                "execution_mode must be 'plain' or 'workspace', got: {execution_mode}"
            )));
        }

        let git_repo = params.get("git_repo").and_then(|v| v.as_str());
        if execution_mode == "workspace" {
            match git_repo {
                Some(url) if valid_git_repo(url) => {}
                Some(url) => {
                    return Err(ToolError::InvalidParameters(format!(
                        "git_repo is not a valid repository URL: {url}"
                    )));
                }
                None => {
                    return Err(ToolError::InvalidParameters(
                        "workspace mode requires 'git_repo'".to_string(),
                    ));
                }
            }
        }

        if ctx.credentials.is_none() {
            return Err(ToolError::MissingContext(
                "no credential context set up for this run".to_string(),
            ));
        }

        let scope = ctx.concierge.as_ref().ok_or_else(|| {
            ToolError::MissingContext("spawn_commis is only available to a concierge turn".to_string())
        })?;

        let commis_id = format!("commis-{}", Uuid::new_v4());
        let job = ctx
            .db
            .create_commis_job(&NewCommisJob {
                owner_id: ctx.owner_id,
                concierge_course_id: scope.course_id,
                task: task.to_string(),
                model: scope.model.clone(),
                commis_id: commis_id.clone(),
                trace_id: scope.trace_id,
                execution_mode: execution_mode.to_string(),
                git_repo: git_repo.map(str::to_string),
            })
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("failed to create commis job: {e}")))?;

        let summary = serde_json::json!({
            "job_id": job.id,
            "commis_id": commis_id,
            "task": task,
            "execution_mode": execution_mode,
        });

        Ok(
            ToolOutput::value(serde_json::json!({"job_id": job.id, "commis_id": commis_id}))
                .with_interrupt(Interrupt::commiss_pending(vec![job.id], vec![summary])),
        )
    }
}
