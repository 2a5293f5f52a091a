//! The concierge service.
//!
//! Owns the singleton concierge fiche and thread per owner, the turn
//! timeout and deferred policy, trace propagation, and continuation
//! execution. The suspended state of a deferred turn is nothing but rows:
//! the barrier plus the deferred course. Continuation re-enters the fiche
//! runner on a fresh task with the thread fully rehydrated.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::context::{ConciergeScope, ExecutionContext};
use crate::credentials::CredentialResolver;
use crate::db::{CourseTotals, Database};
use crate::error::ConciergeError;
use crate::events::{CourseEventLog, Emitter, EventType};
use crate::fiche::{FicheRunError, FicheRunner};
use crate::models::{Course, CourseStatus, CourseTrigger, NewFiche, NewThreadMessage, ThreadKind, preview};
use crate::queue::JobQueue;
use crate::tools::Interrupt;
use crate::transport::{RunnerJobDispatcher, WorkerOutputBuffer};

/// Registry key the commis execution handler is registered under.
pub const COMMIS_JOB_ID: &str = "commis_run";

const CONCIERGE_FICHE_NAME: &str = "Concierge";
const CONCIERGE_SYSTEM_INSTRUCTIONS: &str = "You are the concierge: a long-lived assistant that \
    handles the owner's requests directly when possible and delegates bounded, slow, or remote \
    work to commis workers via the spawn_commis tool. When workers report back, weave their \
    results into a single clear answer.";
const SUMMARY_CHARS: usize = 500;

#[derive(Debug, Clone)]
pub struct ConciergeOptions {
    pub timeout: Duration,
    /// Return as soon as the course defers instead of awaiting the chain.
    pub return_on_deferred: bool,
    pub model: Option<String>,
    pub reasoning_effort: Option<String>,
}

impl Default for ConciergeOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            return_on_deferred: true,
            model: None,
            reasoning_effort: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConciergeResult {
    pub course_id: i64,
    pub thread_id: i64,
    pub status: CourseStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub duration_ms: i64,
}

/// Outcome of driving one turn to its first resting point.
#[derive(Debug, Clone)]
enum TurnOutcome {
    Complete { text: Option<String> },
    Deferred { job_ids: Vec<i64> },
    Failed { error: String },
}

pub struct ConciergeService {
    db: Arc<dyn Database>,
    log: Arc<CourseEventLog>,
    runner: Arc<FicheRunner>,
    queue: Arc<JobQueue>,
    credentials: Option<Arc<dyn CredentialResolver>>,
    dispatcher: Option<Arc<RunnerJobDispatcher>>,
    output_buffer: Option<Arc<WorkerOutputBuffer>>,
    default_model: String,
    commis_max_attempts: i32,
    /// Cancellation tokens for courses with an in-process task.
    active: tokio::sync::Mutex<HashMap<i64, CancellationToken>>,
}

impl ConciergeService {
    pub fn new(
        db: Arc<dyn Database>,
        log: Arc<CourseEventLog>,
        runner: Arc<FicheRunner>,
        queue: Arc<JobQueue>,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            db,
            log,
            runner,
            queue,
            credentials: None,
            dispatcher: None,
            output_buffer: None,
            default_model: default_model.into(),
            commis_max_attempts: 3,
            active: tokio::sync::Mutex::new(HashMap::new()),
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

    pub fn db(&self) -> &Arc<dyn Database> {
        &self.db
    }

    pub fn log(&self) -> &Arc<CourseEventLog> {
        &self.log
    }

    /// The singleton concierge fiche for an owner.
    pub async fn get_or_create_concierge_fiche(
        &self,
        owner_id: i64,
    ) -> Result<crate::models::Fiche, ConciergeError> {
        if let Some(fiche) = self.db.find_concierge_fiche(owner_id).await? {
            return Ok(fiche);
        }
        let fiche = self
            .db
            .create_fiche(&NewFiche {
                owner_id,
                name: CONCIERGE_FICHE_NAME.to_string(),
                system_instructions: CONCIERGE_SYSTEM_INSTRUCTIONS.to_string(),
                task_instructions: String::new(),
                model: self.default_model.clone(),
                reasoning_effort: None,
                allowed_tools: vec!["*".to_string()],
                config: serde_json::Value::Object(Default::default()),
                schedule: None,
                is_concierge: true,
            })
            .await?;
        tracing::info!(owner_id, fiche_id = fiche.id, "created concierge fiche");
        Ok(fiche)
    }

    /// The singleton concierge thread under a concierge fiche.
    pub async fn get_or_create_concierge_thread(
        &self,
        owner_id: i64,
        fiche: &crate::models::Fiche,
    ) -> Result<crate::models::Thread, ConciergeError> {
        if let Some(thread) = self
            .db
            .find_thread_by_kind(fiche.id, ThreadKind::Concierge)
            .await?
        {
            return Ok(thread);
        }
        Ok(self
            .db
            .create_thread(fiche.id, owner_id, CONCIERGE_FICHE_NAME, ThreadKind::Concierge)
            .await?)
    }

    /// Run one concierge turn.
    pub async fn run_concierge(
        self: &Arc<Self>,
        owner_id: i64,
        task: &str,
        opts: ConciergeOptions,
    ) -> Result<ConciergeResult, ConciergeError> {
        let started = Instant::now();
        let fiche = self.get_or_create_concierge_fiche(owner_id).await?;
        let thread = self.get_or_create_concierge_thread(owner_id, &fiche).await?;

        let trace_id = Uuid::new_v4();
        let course = self
            .db
            .create_course(
                fiche.id,
                thread.id,
                CourseTrigger::Api,
                CourseStatus::Running,
                trace_id,
            )
            .await?;
        self.log
            .bus()
            .publish(
                EventType::CourseCreated,
                serde_json::json!({
                    "event_type": EventType::CourseCreated.as_str(),
                    "course_id": course.id,
                    "fiche_id": fiche.id,
                    "thread_id": thread.id,
                    "trace_id": trace_id,
                }),
            )
            .await;

        self.db
            .append_message(&NewThreadMessage::user(thread.id, task))
            .await?;

        let message_id = Uuid::new_v4();
        let emitter = Emitter::concierge(
            Arc::clone(&self.log),
            course.id,
            owner_id,
            message_id,
            trace_id,
        );
        let cancel = CancellationToken::new();
        self.active.lock().await.insert(course.id, cancel.clone());

        let model = opts.model.clone().unwrap_or_else(|| fiche.model.clone());
        let ctx = self
            .base_context(owner_id)
            .with_emitter(emitter)
            .with_cancel(cancel.clone())
            .with_concierge(ConciergeScope {
                course_id: course.id,
                trace_id,
                model,
                reasoning_effort: opts.reasoning_effort.clone(),
            });

        // Subscribe before driving so a fast chain completion can't slip
        // between deferral and the wait.
        let completions = Box::pin(self.log.bus().subscribe_stream());

        let service = Arc::clone(self);
        let course_id = course.id;
        let thread_id = thread.id;
        let drive = tokio::spawn(async move {
            service.drive_turn(ctx, course_id, course_id, thread_id).await
        });
        let drive_abort = drive.abort_handle();

        let outcome = match tokio::time::timeout(opts.timeout, drive).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join_err)) => {
                let error = format!("concierge task panicked: {join_err}");
                self.db.mark_course_failed(course_id, &error).await?;
                TurnOutcome::Failed { error }
            }
            Err(_) => self.settle_timeout(course_id, &cancel, &drive_abort).await?,
        };

        let result = match outcome {
            TurnOutcome::Complete { text } => {
                self.active.lock().await.remove(&course_id);
                ConciergeResult {
                    course_id,
                    thread_id,
                    status: CourseStatus::Success,
                    result: text,
                    error: None,
                    duration_ms: started.elapsed().as_millis() as i64,
                }
            }
            TurnOutcome::Failed { error } => {
                self.active.lock().await.remove(&course_id);
                ConciergeResult {
                    course_id,
                    thread_id,
                    status: CourseStatus::Failed,
                    result: None,
                    error: Some(error),
                    duration_ms: started.elapsed().as_millis() as i64,
                }
            }
            TurnOutcome::Deferred { .. } if opts.return_on_deferred => ConciergeResult {
                course_id,
                thread_id,
                status: CourseStatus::Deferred,
                result: None,
                error: None,
                duration_ms: started.elapsed().as_millis() as i64,
            },
            TurnOutcome::Deferred { .. } => {
                // Await the continuation chain: its terminal event is
                // aliased onto this course's stream.
                let (status, result, error) =
                    self.await_chain_completion(course_id, completions).await;
                self.active.lock().await.remove(&course_id);
                ConciergeResult {
                    course_id,
                    thread_id,
                    status,
                    result,
                    error,
                    duration_ms: started.elapsed().as_millis() as i64,
                }
            }
        };
        Ok(result)
    }

    /// Decide what a turn timeout means: a present barrier keeps the course
    /// deferred and the chain alive; without one the turn has simply hung
    /// and is cancelled.
    async fn settle_timeout(
        &self,
        course_id: i64,
        cancel: &CancellationToken,
        drive: &tokio::task::AbortHandle,
    ) -> Result<TurnOutcome, ConciergeError> {
        // Stop the turn first so nothing mutates the course concurrently
        // with settlement: abort the task (dropping the JoinHandle alone
        // would leave it running), then flag the token for anything the
        // context was already handed to.
        drive.abort();
        cancel.cancel();

        let barrier = self.db.get_barrier(course_id).await?;
        let course = self.db.get_course(course_id).await?;
        let status = course.as_ref().map(|c| c.status).unwrap_or(CourseStatus::Failed);

        // The turn may have settled just before the abort landed.
        match status {
            CourseStatus::Success => {
                return Ok(TurnOutcome::Complete {
                    text: course.and_then(|c| c.summary),
                });
            }
            CourseStatus::Failed => {
                return Ok(TurnOutcome::Failed {
                    error: course
                        .and_then(|c| c.error)
                        .unwrap_or_else(|| "course failed".to_string()),
                });
            }
            _ => {}
        }

        if let Some(barrier) = barrier {
            // Re-arm the queue entries in case the abort cut the deferral
            // between the barrier commit and the enqueue; the dedupe key
            // absorbs the common already-enqueued case.
            for job_id in &barrier.job_ids {
                if let Err(e) = self
                    .queue
                    .enqueue(
                        COMMIS_JOB_ID,
                        serde_json::json!({"commis_job_id": job_id}),
                        chrono::Utc::now(),
                        &format!("commis-{job_id}"),
                        self.commis_max_attempts,
                    )
                    .await
                {
                    tracing::error!(job_id, "failed to re-enqueue commis job: {}", e);
                }
            }
            return Ok(TurnOutcome::Deferred {
                job_ids: barrier.job_ids,
            });
        }
        if status == CourseStatus::Deferred {
            return Ok(TurnOutcome::Deferred { job_ids: Vec::new() });
        }

        let error = "concierge turn timed out".to_string();
        self.db.mark_course_failed(course_id, &error).await?;
        let _ = self
            .log
            .append(
                course_id,
                EventType::Error,
                serde_json::json!({
                    "error_type": "execution_error",
                    "user_message": error,
                }),
            )
            .await;
        Ok(TurnOutcome::Failed { error })
    }

    /// Wait for the aliased terminal event of the continuation chain.
    async fn await_chain_completion(
        &self,
        course_id: i64,
        mut completions: std::pin::Pin<
            Box<dyn futures::Stream<Item = crate::events::BusEvent> + Send>,
        >,
    ) -> (CourseStatus, Option<String>, Option<String>) {
        while let Some(event) = completions.next().await {
            if event.payload.get("course_id").and_then(|v| v.as_i64()) != Some(course_id) {
                continue;
            }
            match event.event_type {
                EventType::CourseComplete => {
                    let result = event
                        .payload
                        .get("result")
                        .and_then(|v| v.as_str())
                        .map(str::to_string);
                    return (CourseStatus::Success, result, None);
                }
                EventType::Error => {
                    let error = event
                        .payload
                        .get("user_message")
                        .and_then(|v| v.as_str())
                        .unwrap_or("continuation failed")
                        .to_string();
                    return (CourseStatus::Failed, None, Some(error));
                }
                _ => {}
            }
        }
        (
            CourseStatus::Failed,
            None,
            Some("event stream closed before completion".to_string()),
        )
    }

    fn base_context(&self, owner_id: i64) -> ExecutionContext {
        let mut ctx = ExecutionContext::new(Arc::clone(&self.db), owner_id);
        if let Some(credentials) = &self.credentials {
            ctx = ctx.with_credentials(Arc::clone(credentials));
        }
        if let Some(dispatcher) = &self.dispatcher {
            ctx = ctx.with_dispatcher(Arc::clone(dispatcher));
        }
        if let Some(buffer) = &self.output_buffer {
            ctx = ctx.with_output_buffer(Arc::clone(buffer));
        }
        ctx
    }

    /// Drive a course to completion, deferral, or failure. `stream_course_id`
    /// is where events land (the root of the chain for continuations).
    async fn drive_turn(
        self: Arc<Self>,
        ctx: ExecutionContext,
        course_id: i64,
        stream_course_id: i64,
        thread_id: i64,
    ) -> TurnOutcome {
        match self.runner.run_thread(&ctx, thread_id).await {
            Ok(outcome) => {
                // An external cancel may have settled the course already.
                match self.db.get_course(course_id).await {
                    Ok(Some(course)) if course.status == CourseStatus::Failed => {
                        return TurnOutcome::Failed {
                            error: course.error.unwrap_or_else(|| "cancelled".to_string()),
                        };
                    }
                    _ => {}
                }
                let text = outcome.final_text().map(str::to_string);
                let totals = CourseTotals {
                    total_tokens: Some(outcome.total_tokens),
                    total_cost_usd: Some(outcome.total_cost_usd),
                    summary: text.as_deref().map(|t| preview(t, SUMMARY_CHARS)),
                };
                if let Err(e) = self.db.mark_course_finished(course_id, &totals).await {
                    tracing::error!(course_id, "failed to finish course: {}", e);
                }
                let _ = self
                    .log
                    .append(
                        stream_course_id,
                        EventType::CourseComplete,
                        serde_json::json!({
                            "result": text,
                            "run_course_id": course_id,
                        }),
                    )
                    .await;
                TurnOutcome::Complete { text }
            }
            Err(FicheRunError::Interrupted(interrupt)) => {
                match self
                    .commit_deferral(course_id, stream_course_id, &interrupt)
                    .await
                {
                    Ok(()) => TurnOutcome::Deferred {
                        job_ids: interrupt.job_ids,
                    },
                    Err(e) => {
                        let error = format!("failed to defer course: {e}");
                        let _ = self.db.mark_course_failed(course_id, &error).await;
                        TurnOutcome::Failed { error }
                    }
                }
            }
            Err(FicheRunError::Cancelled) => TurnOutcome::Failed {
                error: "cancelled".to_string(),
            },
            Err(e) => {
                let error = e.to_string();
                if let Err(mark_err) = self.db.mark_course_failed(course_id, &error).await {
                    tracing::error!(course_id, "failed to mark course failed: {}", mark_err);
                }
                let _ = self
                    .log
                    .append(
                        stream_course_id,
                        EventType::Error,
                        serde_json::json!({
                            "error_type": "execution_error",
                            "user_message": error,
                            "run_course_id": course_id,
                        }),
                    )
                    .await;
                TurnOutcome::Failed { error }
            }
        }
    }

    /// Phase 2 of the spawn commit: barrier + created->queued flip + course
    /// deferral atomically, then the queue entries and the deferred event.
    async fn commit_deferral(
        &self,
        course_id: i64,
        stream_course_id: i64,
        interrupt: &Interrupt,
    ) -> Result<(), ConciergeError> {
        self.db.commit_spawn(course_id, &interrupt.job_ids).await?;

        for job_id in &interrupt.job_ids {
            if let Err(e) = self
                .queue
                .enqueue(
                    COMMIS_JOB_ID,
                    serde_json::json!({"commis_job_id": job_id}),
                    chrono::Utc::now(),
                    &format!("commis-{job_id}"),
                    self.commis_max_attempts,
                )
                .await
            {
                tracing::error!(job_id, "failed to enqueue commis job: {}", e);
            }
        }

        let _ = self
            .log
            .append(
                stream_course_id,
                EventType::CourseDeferred,
                serde_json::json!({
                    "reason": "waiting_for_worker",
                    "close_stream": false,
                    "job_ids": interrupt.job_ids,
                    "created_jobs": interrupt.created_jobs,
                    "run_course_id": course_id,
                }),
            )
            .await;
        Ok(())
    }

    /// Execute a continuation course on a fresh task. Events alias onto the
    /// chain's root stream.
    pub async fn execute_continuation(self: Arc<Self>, continuation: Course) {
        self.execute_course(continuation).await;
    }

    /// Execute any queued or deferred-resumable course: the regular course
    /// execution path for manual, scheduled, webhook and continuation runs.
    /// Events land on the chain's root stream.
    pub async fn execute_course(self: Arc<Self>, course: Course) {
        let course_id = course.id;
        let root = match self.root_course_id(course_id).await {
            Ok(root) => root,
            Err(e) => {
                tracing::error!(course_id, "cannot resolve chain root: {}", e);
                return;
            }
        };

        let thread = match self.db.get_thread(course.thread_id).await {
            Ok(Some(thread)) => thread,
            _ => {
                tracing::error!(course_id, "course thread missing");
                return;
            }
        };
        let model = match self.db.get_fiche(course.fiche_id).await {
            Ok(Some(fiche)) => fiche.model,
            _ => self.default_model.clone(),
        };

        if let Err(e) = self.db.mark_course_running(course_id).await {
            tracing::error!(course_id, "failed to start course: {}", e);
            return;
        }

        let emitter = Emitter::concierge(
            Arc::clone(&self.log),
            root,
            thread.owner_id,
            Uuid::new_v4(),
            course.trace_id,
        );
        let cancel = CancellationToken::new();
        self.active.lock().await.insert(course_id, cancel.clone());

        let ctx = self
            .base_context(thread.owner_id)
            .with_emitter(emitter)
            .with_cancel(cancel)
            .with_concierge(ConciergeScope {
                course_id,
                trace_id: course.trace_id,
                model,
                reasoning_effort: None,
            });

        let outcome = Arc::clone(&self)
            .drive_turn(ctx, course_id, root, thread.id)
            .await;
        self.active.lock().await.remove(&course_id);
        tracing::info!(course_id, root, outcome = discriminant_name(&outcome), "course settled");
    }

    /// Walk `continuation_of_course_id` back to the originating course.
    pub async fn root_course_id(&self, course_id: i64) -> Result<i64, ConciergeError> {
        let mut current = course_id;
        loop {
            let course = self
                .db
                .get_course(current)
                .await?
                .ok_or(ConciergeError::CourseNotFound(current))?;
            match course.continuation_of_course_id {
                Some(parent) => current = parent,
                None => return Ok(current),
            }
        }
    }

    /// The full continuation chain starting from a root course.
    pub async fn continuation_chain(&self, root_id: i64) -> Result<Vec<Course>, ConciergeError> {
        let mut chain = Vec::new();
        let mut current = self
            .db
            .get_course(root_id)
            .await?
            .ok_or(ConciergeError::CourseNotFound(root_id))?;
        loop {
            let next = self.db.find_continuation(current.id).await?;
            chain.push(current);
            match next {
                Some(next) => current = next,
                None => return Ok(chain),
            }
        }
    }

    /// External cancel: settle the course, stop the in-process task, and
    /// cascade-cancel outstanding commis.
    pub async fn cancel_course(
        &self,
        barrier_manager: &crate::concierge::BarrierManager,
        course_id: i64,
    ) -> Result<bool, ConciergeError> {
        let course = self
            .db
            .get_course(course_id)
            .await?
            .ok_or(ConciergeError::CourseNotFound(course_id))?;
        if matches!(course.status, CourseStatus::Success | CourseStatus::Failed) {
            return Ok(false);
        }

        if let Some(token) = self.active.lock().await.remove(&course_id) {
            token.cancel();
        }
        barrier_manager.cancel_all(course_id).await?;
        self.db.mark_course_failed(course_id, "cancelled").await?;
        let _ = self
            .log
            .append(
                course_id,
                EventType::Error,
                serde_json::json!({
                    "error_type": "execution_error",
                    "user_message": "course cancelled",
                    "cancelled": true,
                }),
            )
            .await;
        Ok(true)
    }
}

fn discriminant_name(outcome: &TurnOutcome) -> &'static str {
    match outcome {
        TurnOutcome::Complete { .. } => "complete",
        TurnOutcome::Deferred { .. } => "deferred",
        TurnOutcome::Failed { .. } => "failed",
    }
}
