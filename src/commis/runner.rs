//! Queue handler for commis jobs.
//!
//! Picks up a queued commis job, instantiates a dedicated short-lived
//! fiche with its own thread, runs it through the fiche runner with a
//! commis emitter aimed at the parent course stream, then releases the
//! barrier. The release that clears the barrier hands back a continuation,
//! which is executed as a detached task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::concierge::{BarrierManager, ConciergeService};
use crate::context::ExecutionContext;
use crate::credentials::CredentialResolver;
use crate::db::Database;
use crate::error::QueueError;
use crate::events::{CourseEventLog, Emitter, EventType};
use crate::fiche::{FicheRunner, RunOutcome};
use crate::models::{CommisJob, CommisStatus, MessageRole, NewFiche, NewThreadMessage, ThreadKind};
use crate::queue::JobHandler;
use crate::tools::envelope_is_critical;
use crate::transport::{RunnerJobDispatcher, WorkerOutputBuffer};

const COMMIS_SYSTEM_INSTRUCTIONS: &str = "You are a commis: a focused worker executing one \
    bounded task handed down by the concierge. Do the work, then state the outcome plainly; \
    your final message is reported back verbatim.";
const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(600);

pub struct CommisRunner {
    db: Arc<dyn Database>,
    log: Arc<CourseEventLog>,
    runner: Arc<FicheRunner>,
    barrier: Arc<BarrierManager>,
    concierge: Arc<ConciergeService>,
    credentials: Option<Arc<dyn CredentialResolver>>,
    dispatcher: Option<Arc<RunnerJobDispatcher>>,
    output_buffer: Option<Arc<WorkerOutputBuffer>>,
    job_timeout: Duration,
}

impl CommisRunner {
    pub fn new(
        db: Arc<dyn Database>,
        log: Arc<CourseEventLog>,
        runner: Arc<FicheRunner>,
        barrier: Arc<BarrierManager>,
        concierge: Arc<ConciergeService>,
    ) -> Self {
        Self {
            db,
            log,
            runner,
            barrier,
            concierge,
            credentials: None,
            dispatcher: None,
            output_buffer: None,
            job_timeout: DEFAULT_JOB_TIMEOUT,
        }
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialResolver>) -> Self {
        self.credentials = Some(credentials);
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

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Get-or-create the dedicated fiche for a commis job. The commis_id
    /// doubles as the unique fiche name, so at-least-once retries reuse it.
    async fn commis_fiche(&self, job: &CommisJob) -> Result<crate::models::Fiche, QueueError> {
        let existing = self
            .db
            .list_fiches(Some(job.owner_id))
            .await?
            .into_iter()
            .find(|f| f.name == job.commis_id);
        if let Some(fiche) = existing {
            return Ok(fiche);
        }
        let mut fiche = NewFiche::basic(job.owner_id, job.commis_id.clone(), job.model.clone());
        fiche.system_instructions = COMMIS_SYSTEM_INSTRUCTIONS.to_string();
        Ok(self.db.create_fiche(&fiche).await?)
    }

    /// Run the commis fiche over its thread and reduce the outcome to a
    /// terminal status plus summary.
    async fn execute(&self, job: &CommisJob) -> (CommisStatus, String) {
        let fiche = match self.commis_fiche(job).await {
            Ok(fiche) => fiche,
            Err(e) => return (CommisStatus::Failed, format!("failed to set up commis: {e}")),
        };

        let thread = match self.db.find_thread_by_kind(fiche.id, ThreadKind::Commis).await {
            Ok(Some(thread)) => thread,
            Ok(None) => match self
                .db
                .create_thread(fiche.id, job.owner_id, &job.commis_id, ThreadKind::Commis)
                .await
            {
                Ok(thread) => thread,
                Err(e) => {
                    return (CommisStatus::Failed, format!("failed to create thread: {e}"));
                }
            },
            Err(e) => return (CommisStatus::Failed, format!("failed to load thread: {e}")),
        };

        // Seed the task unless a prior attempt already left it pending.
        match self.db.list_unprocessed_messages(thread.id).await {
            Ok(pending) if pending.is_empty() => {
                if let Err(e) = self
                    .db
                    .append_message(&NewThreadMessage::user(thread.id, job.task.clone()))
                    .await
                {
                    return (CommisStatus::Failed, format!("failed to seed task: {e}"));
                }
            }
            Ok(_) => {}
            Err(e) => return (CommisStatus::Failed, format!("failed to read thread: {e}")),
        }

        let emitter = Emitter::commis(
            Arc::clone(&self.log),
            job.concierge_course_id,
            job.owner_id,
            Uuid::new_v4(),
            job.trace_id,
        );
        let cancel = CancellationToken::new();
        let mut ctx = ExecutionContext::new(Arc::clone(&self.db), job.owner_id)
            .with_emitter(emitter)
            .with_cancel(cancel.clone())
            .with_worker_id(job.commis_id.clone());
        if let Some(credentials) = &self.credentials {
            ctx = ctx.with_credentials(Arc::clone(credentials));
        }
        if let Some(dispatcher) = &self.dispatcher {
            ctx = ctx.with_dispatcher(Arc::clone(dispatcher));
        }
        if let Some(buffer) = &self.output_buffer {
            ctx = ctx.with_output_buffer(Arc::clone(buffer));
        }

        match tokio::time::timeout(self.job_timeout, self.runner.run_thread(&ctx, thread.id)).await
        {
            Ok(Ok(outcome)) => reduce_outcome(&outcome),
            Ok(Err(e)) => (CommisStatus::Failed, e.to_string()),
            Err(_) => {
                cancel.cancel();
                (
                    CommisStatus::Failed,
                    format!("commis timed out after {:?}", self.job_timeout),
                )
            }
        }
    }
}

/// A run is a success only when it produced a terminal answer; a trailing
/// critical error envelope with no answer means the tool layer failed and
/// the summary must not pretend otherwise.
fn reduce_outcome(outcome: &RunOutcome) -> (CommisStatus, String) {
    if let Some(text) = outcome.final_text() {
        return (CommisStatus::Success, text.to_string());
    }
    let critical = outcome
        .new_messages
        .iter()
        .rev()
        .filter(|m| m.role == MessageRole::Tool)
        .find_map(|m| {
            let value: serde_json::Value = serde_json::from_str(&m.content).ok()?;
            envelope_is_critical(&value).then(|| {
                value
                    .get("user_message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("critical tool error")
                    .to_string()
            })
        });
    match critical {
        Some(error) => (CommisStatus::Failed, error),
        None => (CommisStatus::Success, "(no output)".to_string()),
    }
}

#[async_trait]
impl JobHandler for CommisRunner {
    async fn run(
        &self,
        payload: &serde_json::Value,
        _secrets: &HashMap<String, SecretString>,
    ) -> Result<(), QueueError> {
        let job_id = payload
            .get("commis_job_id")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| QueueError::Execution("payload missing commis_job_id".to_string()))?;

        let job = self
            .db
            .get_commis_job(job_id)
            .await?
            .ok_or_else(|| QueueError::Execution(format!("commis job {job_id} not found")))?;

        match job.status {
            CommisStatus::Queued | CommisStatus::Created => {}
            // Zombie retry of an attempt that died mid-run.
            CommisStatus::Running => {
                tracing::warn!(job_id, "re-running commis job left in running state");
            }
            terminal => {
                tracing::debug!(job_id, status = %terminal, "duplicate commis delivery ignored");
                return Ok(());
            }
        }

        self.db
            .update_commis_status(job_id, CommisStatus::Running, None)
            .await?;
        let _ = self
            .log
            .append(
                job.concierge_course_id,
                EventType::CommisStarted,
                serde_json::json!({
                    "job_id": job.id,
                    "commis_id": job.commis_id,
                    "task": job.task,
                    "trace_id": job.trace_id,
                }),
            )
            .await;
        tracing::info!(
            job_id,
            commis_id = %job.commis_id,
            course_id = job.concierge_course_id,
            "commis started"
        );

        let (status, summary) = self.execute(&job).await;

        let ready = self
            .barrier
            .release(job_id, status, Some(&summary))
            .await
            .map_err(|e| QueueError::Execution(e.to_string()))?;

        if let Some(ready) = ready {
            if ready.created {
                // Detached: the continuation re-enters the concierge on its
                // own task; observers follow it on the originating stream.
                let concierge = Arc::clone(&self.concierge);
                tokio::spawn(concierge.execute_continuation(ready.course));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ThreadMessage, ToolCallRecord};
    use chrono::Utc;
    use rust_decimal::Decimal;

    fn tool_message(content: &str) -> ThreadMessage {
        ThreadMessage {
            id: 1,
            thread_id: 1,
            role: MessageRole::Tool,
            content: content.to_string(),
            message_uuid: None,
            tool_calls: Vec::<ToolCallRecord>::new(),
            tool_call_id: Some("call_1".to_string()),
            processed: true,
            created_at: Utc::now(),
        }
    }

    fn outcome_with(messages: Vec<ThreadMessage>) -> RunOutcome {
        RunOutcome {
            new_messages: messages,
            total_tokens: 0,
            total_cost_usd: Decimal::ZERO,
        }
    }

    #[test]
    fn final_text_wins() {
        let mut assistant = tool_message("irrelevant");
        assistant.role = MessageRole::Assistant;
        assistant.content = "/dev/sda1 45%".to_string();
        let (status, summary) = reduce_outcome(&outcome_with(vec![assistant]));
        assert_eq!(status, CommisStatus::Success);
        assert_eq!(summary, "/dev/sda1 45%");
    }

    #[test]
    fn trailing_critical_envelope_fails_the_job() {
        let envelope = r#"{"ok":false,"error_type":"missing_context","user_message":"no creds","details":null}"#;
        let (status, summary) = reduce_outcome(&outcome_with(vec![tool_message(envelope)]));
        assert_eq!(status, CommisStatus::Failed);
        assert_eq!(summary, "no creds");
    }

    #[test]
    fn non_critical_envelope_without_text_is_still_success() {
        let envelope = r#"{"ok":false,"error_type":"execution_error","user_message":"flaky","details":null}"#;
        let (status, _) = reduce_outcome(&outcome_with(vec![tool_message(envelope)]));
        assert_eq!(status, CommisStatus::Success);
    }
}
