//! Database abstraction layer.
//!
//! One trait covers every table; `PostgresDatabase` is the production
//! backend, `MemoryDatabase` backs tests and `--memory-db` dev runs.
//! Multi-row invariants (continuation uniqueness, barrier mutation, queue
//! claims) are trait methods so each backend can make them atomic.

mod memory;
mod postgres;

pub use memory::MemoryDatabase;
pub use postgres::{PostgresDatabase, connect_pool, run_migrations};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::models::{
    CommisBarrier, CommisJob, CommisStatus, Course, CourseEvent, CourseStatus, CourseTrigger,
    DeviceToken, Fiche, NewFiche, NewThreadMessage, QueueEntry, QueueStatus, Runner, RunnerJob,
    RunnerJobStatus, RunnerStatus, Thread, ThreadKind, ThreadMessage, TriggerKind, TriggerRow,
    User, UserRole, Workflow, WorkflowNode,
};

/// Outcome of an enqueue attempt. `newly_queued=false` means the unique
/// `(job_id, dedupe_key)` index already held a row and the caller's insert
/// was a no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOutcome {
    pub entry_id: i64,
    pub newly_queued: bool,
}

/// Parameters for inserting a commis job (status starts at `created`).
#[derive(Debug, Clone)]
pub struct NewCommisJob {
    pub owner_id: i64,
    pub concierge_course_id: i64,
    pub task: String,
    pub model: String,
    pub commis_id: String,
    pub trace_id: Uuid,
    pub execution_mode: String,
    pub git_repo: Option<String>,
}

/// Result of removing one job from a barrier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarrierRelease {
    /// Jobs still outstanding after the removal. Zero means the barrier
    /// row was deleted in the same operation.
    pub remaining: usize,
    /// False when no barrier held the job (already released or torn down).
    pub removed: bool,
}

/// Terminal bookkeeping for a finished course.
#[derive(Debug, Clone, Default)]
pub struct CourseTotals {
    pub total_tokens: Option<i64>,
    pub total_cost_usd: Option<rust_decimal::Decimal>,
    pub summary: Option<String>,
}

/// Result of failing a queue entry: where the entry ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Reset to pending with backoff applied to scheduled_for.
    Retrying { attempts: i32 },
    /// Attempts exhausted; dead-lettered.
    Dead { attempts: i32 },
}

#[async_trait]
pub trait Database: Send + Sync {
    // --- Users ---

    async fn create_user(
        &self,
        email: &str,
        provider: Option<&str>,
        role: UserRole,
    ) -> Result<User, DatabaseError>;

    async fn get_user(&self, id: i64) -> Result<Option<User>, DatabaseError>;

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, DatabaseError>;

    async fn count_users(&self) -> Result<i64, DatabaseError>;

    // --- Fiches ---

    async fn create_fiche(&self, fiche: &NewFiche) -> Result<Fiche, DatabaseError>;

    async fn get_fiche(&self, id: i64) -> Result<Option<Fiche>, DatabaseError>;

    async fn list_fiches(&self, owner_id: Option<i64>) -> Result<Vec<Fiche>, DatabaseError>;

    async fn update_fiche(&self, fiche: &Fiche) -> Result<(), DatabaseError>;

    /// Cascade-deletes threads, messages, courses and events under the fiche.
    async fn delete_fiche(&self, id: i64) -> Result<bool, DatabaseError>;

    async fn set_fiche_status(
        &self,
        id: i64,
        status: crate::models::FicheStatus,
    ) -> Result<(), DatabaseError>;

    /// The singleton concierge fiche for an owner, if one exists.
    async fn find_concierge_fiche(&self, owner_id: i64) -> Result<Option<Fiche>, DatabaseError>;

    /// All fiches carrying a cron schedule, across owners.
    async fn list_scheduled_fiches(&self) -> Result<Vec<Fiche>, DatabaseError>;

    // --- Threads ---

    async fn create_thread(
        &self,
        fiche_id: i64,
        owner_id: i64,
        title: &str,
        kind: ThreadKind,
    ) -> Result<Thread, DatabaseError>;

    async fn get_thread(&self, id: i64) -> Result<Option<Thread>, DatabaseError>;

    async fn list_threads(&self, owner_id: Option<i64>) -> Result<Vec<Thread>, DatabaseError>;

    async fn update_thread_title(&self, id: i64, title: &str) -> Result<(), DatabaseError>;

    async fn delete_thread(&self, id: i64) -> Result<bool, DatabaseError>;

    /// First thread of the given kind under a fiche (concierge threads are
    /// per-owner singletons located this way).
    async fn find_thread_by_kind(
        &self,
        fiche_id: i64,
        kind: ThreadKind,
    ) -> Result<Option<Thread>, DatabaseError>;

    /// Checkpoint blob accessors keyed by thread.
    async fn get_thread_state(
        &self,
        thread_id: i64,
    ) -> Result<Option<serde_json::Value>, DatabaseError>;

    async fn set_thread_state(
        &self,
        thread_id: i64,
        state: Option<&serde_json::Value>,
    ) -> Result<(), DatabaseError>;

    // --- Thread messages ---

    async fn append_message(
        &self,
        message: &NewThreadMessage,
    ) -> Result<ThreadMessage, DatabaseError>;

    async fn list_messages(&self, thread_id: i64) -> Result<Vec<ThreadMessage>, DatabaseError>;

    async fn list_unprocessed_messages(
        &self,
        thread_id: i64,
    ) -> Result<Vec<ThreadMessage>, DatabaseError>;

    async fn mark_messages_processed(&self, ids: &[i64]) -> Result<(), DatabaseError>;

    // --- Courses ---

    async fn create_course(
        &self,
        fiche_id: i64,
        thread_id: i64,
        trigger: CourseTrigger,
        status: CourseStatus,
        trace_id: Uuid,
    ) -> Result<Course, DatabaseError>;

    async fn get_course(&self, id: i64) -> Result<Option<Course>, DatabaseError>;

    async fn list_courses(
        &self,
        fiche_id: i64,
        owner_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Course>, DatabaseError>;

    async fn mark_course_running(&self, id: i64) -> Result<(), DatabaseError>;

    async fn mark_course_deferred(&self, id: i64) -> Result<(), DatabaseError>;

    async fn mark_course_finished(
        &self,
        id: i64,
        totals: &CourseTotals,
    ) -> Result<(), DatabaseError>;

    async fn mark_course_failed(&self, id: i64, error: &str) -> Result<(), DatabaseError>;

    async fn find_continuation(&self, parent_id: i64) -> Result<Option<Course>, DatabaseError>;

    /// Atomically create the continuation course for `parent_id` and inject
    /// the worker tool messages into the thread; or, when the unique index
    /// on `continuation_of_course_id` says one already exists, return it
    /// untouched. The bool is true only for the caller that inserted.
    async fn create_continuation(
        &self,
        parent_id: i64,
        fiche_id: i64,
        thread_id: i64,
        trace_id: Uuid,
        tool_messages: &[NewThreadMessage],
    ) -> Result<(Course, bool), DatabaseError>;

    /// Courses stuck in `running` (used by crash recovery).
    async fn list_running_courses(&self) -> Result<Vec<Course>, DatabaseError>;

    // --- Course events ---

    /// Insert the next event for a course, assigning `seq` under a
    /// per-course lock so numbers are strictly increasing from 1.
    async fn append_course_event(
        &self,
        course_id: i64,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> Result<CourseEvent, DatabaseError>;

    /// Events with `seq > after_seq`, ordered by seq (SSE replay).
    async fn list_course_events_after(
        &self,
        course_id: i64,
        after_seq: i64,
    ) -> Result<Vec<CourseEvent>, DatabaseError>;

    // --- Commis jobs & barriers ---

    async fn create_commis_job(&self, job: &NewCommisJob) -> Result<CommisJob, DatabaseError>;

    async fn get_commis_job(&self, id: i64) -> Result<Option<CommisJob>, DatabaseError>;

    async fn list_commis_jobs(
        &self,
        owner_id: Option<i64>,
    ) -> Result<Vec<CommisJob>, DatabaseError>;

    async fn update_commis_status(
        &self,
        id: i64,
        status: CommisStatus,
        result_summary: Option<&str>,
    ) -> Result<(), DatabaseError>;

    /// Phase-2 commit of a spawn: create the barrier row, flip each job
    /// created->queued and mark the parent course deferred, atomically.
    async fn commit_spawn(&self, course_id: i64, job_ids: &[i64]) -> Result<(), DatabaseError>;

    async fn get_barrier(&self, course_id: i64) -> Result<Option<CommisBarrier>, DatabaseError>;

    /// Remove one job from the barrier under the per-course lock; deletes
    /// the barrier row when the set empties.
    async fn barrier_remove_job(
        &self,
        course_id: i64,
        job_id: i64,
    ) -> Result<BarrierRelease, DatabaseError>;

    async fn delete_barrier(&self, course_id: i64) -> Result<(), DatabaseError>;

    async fn list_barriers(&self) -> Result<Vec<CommisBarrier>, DatabaseError>;

    // --- Runners & runner jobs ---

    async fn create_runner(
        &self,
        owner_id: i64,
        name: &str,
        auth_secret_hash: &str,
    ) -> Result<Runner, DatabaseError>;

    async fn get_runner(&self, id: i64) -> Result<Option<Runner>, DatabaseError>;

    async fn list_runners(&self, owner_id: Option<i64>) -> Result<Vec<Runner>, DatabaseError>;

    async fn set_runner_status(
        &self,
        id: i64,
        status: RunnerStatus,
        heartbeat: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError>;

    /// All runners flip offline at startup until they re-connect.
    async fn mark_all_runners_offline(&self) -> Result<u64, DatabaseError>;

    async fn create_runner_job(&self, job: &RunnerJob) -> Result<(), DatabaseError>;

    async fn get_runner_job(&self, id: Uuid) -> Result<Option<RunnerJob>, DatabaseError>;

    async fn update_runner_job_status(
        &self,
        id: Uuid,
        status: RunnerJobStatus,
        exit_code: Option<i32>,
    ) -> Result<(), DatabaseError>;

    /// Append a chunk to the persisted stdout/stderr tail of the job.
    async fn append_runner_job_output(
        &self,
        id: Uuid,
        stream: &str,
        data: &str,
    ) -> Result<(), DatabaseError>;

    // --- Job queue ---

    /// `INSERT … ON CONFLICT DO NOTHING` on `(job_id, dedupe_key)`.
    async fn enqueue(
        &self,
        job_id: &str,
        payload: &serde_json::Value,
        scheduled_for: DateTime<Utc>,
        dedupe_key: &str,
        max_attempts: i32,
    ) -> Result<EnqueueOutcome, DatabaseError>;

    /// Claim the earliest pending entry due by `now` (SKIP LOCKED), setting
    /// status=running and the caller's lease.
    async fn claim_queue_entry(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> Result<Option<QueueEntry>, DatabaseError>;

    /// Extend a held lease. Returns false when the lease is no longer ours.
    async fn extend_lease(
        &self,
        entry_id: i64,
        worker_id: &str,
        until: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    async fn complete_queue_entry(&self, entry_id: i64) -> Result<(), DatabaseError>;

    /// Record a failed attempt: retry with backoff or dead-letter.
    async fn fail_queue_entry(
        &self,
        entry_id: i64,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<FailOutcome, DatabaseError>;

    /// Dead-letter immediately (e.g. missing required secrets).
    async fn dead_letter_queue_entry(
        &self,
        entry_id: i64,
        error: &str,
    ) -> Result<(), DatabaseError>;

    /// Reset running entries whose lease expired back to pending,
    /// preserving attempts. Returns the number of zombies recovered.
    async fn reset_zombie_entries(&self, now: DateTime<Utc>) -> Result<u64, DatabaseError>;

    async fn get_queue_entry(&self, entry_id: i64) -> Result<Option<QueueEntry>, DatabaseError>;

    async fn list_queue_entries(
        &self,
        job_id: Option<&str>,
        status: Option<QueueStatus>,
    ) -> Result<Vec<QueueEntry>, DatabaseError>;

    /// Most recent scheduled_for ever enqueued for a job (backfill anchor).
    async fn latest_scheduled_for(
        &self,
        job_id: &str,
    ) -> Result<Option<DateTime<Utc>>, DatabaseError>;

    // --- Triggers ---

    async fn create_trigger(
        &self,
        fiche_id: i64,
        kind: TriggerKind,
        secret_hash: &str,
    ) -> Result<TriggerRow, DatabaseError>;

    async fn get_trigger(&self, id: i64) -> Result<Option<TriggerRow>, DatabaseError>;

    async fn delete_trigger(&self, id: i64) -> Result<bool, DatabaseError>;

    // --- Device tokens ---

    async fn upsert_device_token(
        &self,
        owner_id: i64,
        device_id: &str,
        token_hash: &str,
    ) -> Result<DeviceToken, DatabaseError>;

    async fn find_device_token(
        &self,
        device_id: &str,
    ) -> Result<Option<DeviceToken>, DatabaseError>;

    // --- Workflows ---

    async fn create_workflow(
        &self,
        owner_id: i64,
        name: &str,
        nodes: &[WorkflowNode],
    ) -> Result<Workflow, DatabaseError>;

    async fn get_workflow(&self, id: i64) -> Result<Option<Workflow>, DatabaseError>;

    async fn list_workflows(&self, owner_id: Option<i64>) -> Result<Vec<Workflow>, DatabaseError>;
}
