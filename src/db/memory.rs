//! Ephemeral in-memory backend.
//!
//! Backs the test suite and `--memory-db` dev runs. Enforces the same
//! uniqueness invariants the SQL schema does (continuation back-pointer,
//! queue dedupe key) so idempotency tests exercise real behavior, not a
//! permissive stub. State dies with the process.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::db::{
    BarrierRelease, CourseTotals, Database, EnqueueOutcome, FailOutcome, NewCommisJob,
};
use crate::error::DatabaseError;
use crate::models::{
    CommisBarrier, CommisJob, CommisStatus, Course, CourseEvent, CourseStatus, CourseTrigger,
    DeviceToken, Fiche, FicheStatus, NewFiche, NewThreadMessage, QueueEntry, QueueStatus, Runner,
    RunnerJob, RunnerJobStatus, RunnerStatus, Thread, ThreadKind, ThreadMessage, TriggerKind,
    TriggerRow, User, UserRole, Workflow, WorkflowNode,
};

#[derive(Default)]
struct Inner {
    next_id: i64,
    users: Vec<User>,
    fiches: Vec<Fiche>,
    threads: Vec<Thread>,
    messages: Vec<ThreadMessage>,
    courses: Vec<Course>,
    course_events: Vec<CourseEvent>,
    commis_jobs: Vec<CommisJob>,
    barriers: HashMap<i64, CommisBarrier>,
    runners: Vec<Runner>,
    runner_jobs: Vec<RunnerJob>,
    queue: Vec<QueueEntry>,
    triggers: Vec<TriggerRow>,
    device_tokens: Vec<DeviceToken>,
    workflows: Vec<Workflow>,
}

impl Inner {
    fn id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn insert_message(&mut self, message: &NewThreadMessage) -> ThreadMessage {
        let row = ThreadMessage {
            id: self.id(),
            thread_id: message.thread_id,
            role: message.role,
            content: message.content.clone(),
            message_uuid: message.message_uuid,
            tool_calls: message.tool_calls.clone(),
            tool_call_id: message.tool_call_id.clone(),
            processed: message.processed,
            created_at: Utc::now(),
        };
        self.messages.push(row.clone());
        row
    }

    fn course_mut(&mut self, id: i64) -> Option<&mut Course> {
        self.courses.iter_mut().find(|c| c.id == id)
    }
}

/// All-tables in-memory datastore behind one async mutex.
#[derive(Default)]
pub struct MemoryDatabase {
    inner: Mutex<Inner>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    // --- Users ---

    async fn create_user(
        &self,
        email: &str,
        provider: Option<&str>,
        role: UserRole,
    ) -> Result<User, DatabaseError> {
        let mut inner = self.inner.lock().await;
        if inner.users.iter().any(|u| u.email == email) {
            return Err(DatabaseError::UniqueViolation(format!(
                "users.email: {email}"
            )));
        }
        let user = User {
            id: inner.id(),
            email: email.to_string(),
            role,
            provider: provider.map(str::to_string),
            created_at: Utc::now(),
        };
        inner.users.push(user.clone());
        Ok(user)
    }

    async fn get_user(&self, id: i64) -> Result<Option<User>, DatabaseError> {
        let inner = self.inner.lock().await;
        Ok(inner.users.iter().find(|u| u.id == id).cloned())
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, DatabaseError> {
        let inner = self.inner.lock().await;
        Ok(inner.users.iter().find(|u| u.email == email).cloned())
    }

    async fn count_users(&self) -> Result<i64, DatabaseError> {
        let inner = self.inner.lock().await;
        Ok(inner.users.len() as i64)
    }

    // --- Fiches ---

    async fn create_fiche(&self, fiche: &NewFiche) -> Result<Fiche, DatabaseError> {
        let mut inner = self.inner.lock().await;
        if inner
            .fiches
            .iter()
            .any(|f| f.owner_id == fiche.owner_id && f.name == fiche.name)
        {
            return Err(DatabaseError::UniqueViolation(format!(
                "fiches(owner_id, name): {}",
                fiche.name
            )));
        }
        let now = Utc::now();
        let row = Fiche {
            id: inner.id(),
            owner_id: fiche.owner_id,
            name: fiche.name.clone(),
            system_instructions: fiche.system_instructions.clone(),
            task_instructions: fiche.task_instructions.clone(),
            model: fiche.model.clone(),
            reasoning_effort: fiche.reasoning_effort.clone(),
            allowed_tools: fiche.allowed_tools.clone(),
            config: fiche.config.clone(),
            schedule: fiche.schedule.clone(),
            status: FicheStatus::Idle,
            is_concierge: fiche.is_concierge,
            created_at: now,
            updated_at: now,
        };
        inner.fiches.push(row.clone());
        Ok(row)
    }

    async fn get_fiche(&self, id: i64) -> Result<Option<Fiche>, DatabaseError> {
        let inner = self.inner.lock().await;
        Ok(inner.fiches.iter().find(|f| f.id == id).cloned())
    }

    async fn list_fiches(&self, owner_id: Option<i64>) -> Result<Vec<Fiche>, DatabaseError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .fiches
            .iter()
            .filter(|f| owner_id.is_none_or(|o| f.owner_id == o))
            .cloned()
            .collect())
    }

    async fn update_fiche(&self, fiche: &Fiche) -> Result<(), DatabaseError> {
        let mut inner = self.inner.lock().await;
        if let Some(row) = inner.fiches.iter_mut().find(|f| f.id == fiche.id) {
            *row = Fiche {
                updated_at: Utc::now(),
                status: row.status,
                created_at: row.created_at,
                ..fiche.clone()
            };
        }
        Ok(())
    }

    async fn delete_fiche(&self, id: i64) -> Result<bool, DatabaseError> {
        let mut inner = self.inner.lock().await;
        let before = inner.fiches.len();
        inner.fiches.retain(|f| f.id != id);
        let thread_ids: Vec<i64> = inner
            .threads
            .iter()
            .filter(|t| t.fiche_id == id)
            .map(|t| t.id)
            .collect();
        inner.threads.retain(|t| t.fiche_id != id);
        inner.messages.retain(|m| !thread_ids.contains(&m.thread_id));
        let course_ids: Vec<i64> = inner
            .courses
            .iter()
            .filter(|c| c.fiche_id == id)
            .map(|c| c.id)
            .collect();
        inner.courses.retain(|c| c.fiche_id != id);
        inner
            .course_events
            .retain(|e| !course_ids.contains(&e.course_id));
        inner
            .commis_jobs
            .retain(|j| !course_ids.contains(&j.concierge_course_id));
        for course_id in course_ids {
            inner.barriers.remove(&course_id);
        }
        inner.triggers.retain(|t| t.fiche_id != id);
        Ok(inner.fiches.len() < before)
    }

    async fn set_fiche_status(&self, id: i64, status: FicheStatus) -> Result<(), DatabaseError> {
        let mut inner = self.inner.lock().await;
        if let Some(row) = inner.fiches.iter_mut().find(|f| f.id == id) {
            row.status = status;
            row.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn find_concierge_fiche(&self, owner_id: i64) -> Result<Option<Fiche>, DatabaseError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .fiches
            .iter()
            .find(|f| f.owner_id == owner_id && f.is_concierge)
            .cloned())
    }

    async fn list_scheduled_fiches(&self) -> Result<Vec<Fiche>, DatabaseError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .fiches
            .iter()
            .filter(|f| f.schedule.is_some())
            .cloned()
            .collect())
    }

    // --- Threads ---

    async fn create_thread(
        &self,
        fiche_id: i64,
        owner_id: i64,
        title: &str,
        kind: ThreadKind,
    ) -> Result<Thread, DatabaseError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let row = Thread {
            id: inner.id(),
            fiche_id,
            owner_id,
            title: title.to_string(),
            kind,
            fiche_state: None,
            created_at: now,
            updated_at: now,
        };
        inner.threads.push(row.clone());
        Ok(row)
    }

    async fn get_thread(&self, id: i64) -> Result<Option<Thread>, DatabaseError> {
        let inner = self.inner.lock().await;
        Ok(inner.threads.iter().find(|t| t.id == id).cloned())
    }

    async fn list_threads(&self, owner_id: Option<i64>) -> Result<Vec<Thread>, DatabaseError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .threads
            .iter()
            .filter(|t| owner_id.is_none_or(|o| t.owner_id == o))
            .cloned()
            .collect())
    }

    async fn update_thread_title(&self, id: i64, title: &str) -> Result<(), DatabaseError> {
        let mut inner = self.inner.lock().await;
        if let Some(row) = inner.threads.iter_mut().find(|t| t.id == id) {
            row.title = title.to_string();
            row.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn delete_thread(&self, id: i64) -> Result<bool, DatabaseError> {
        let mut inner = self.inner.lock().await;
        let before = inner.threads.len();
        inner.threads.retain(|t| t.id != id);
        inner.messages.retain(|m| m.thread_id != id);
        Ok(inner.threads.len() < before)
    }

    async fn find_thread_by_kind(
        &self,
        fiche_id: i64,
        kind: ThreadKind,
    ) -> Result<Option<Thread>, DatabaseError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .threads
            .iter()
            .find(|t| t.fiche_id == fiche_id && t.kind == kind)
            .cloned())
    }

    async fn get_thread_state(
        &self,
        thread_id: i64,
    ) -> Result<Option<serde_json::Value>, DatabaseError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .threads
            .iter()
            .find(|t| t.id == thread_id)
            .and_then(|t| t.fiche_state.clone()))
    }

    async fn set_thread_state(
        &self,
        thread_id: i64,
        state: Option<&serde_json::Value>,
    ) -> Result<(), DatabaseError> {
        let mut inner = self.inner.lock().await;
        if let Some(row) = inner.threads.iter_mut().find(|t| t.id == thread_id) {
            row.fiche_state = state.cloned();
            row.updated_at = Utc::now();
        }
        Ok(())
    }

    // --- Thread messages ---

    async fn append_message(
        &self,
        message: &NewThreadMessage,
    ) -> Result<ThreadMessage, DatabaseError> {
        let mut inner = self.inner.lock().await;
        Ok(inner.insert_message(message))
    }

    async fn list_messages(&self, thread_id: i64) -> Result<Vec<ThreadMessage>, DatabaseError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .messages
            .iter()
            .filter(|m| m.thread_id == thread_id)
            .cloned()
            .collect())
    }

    async fn list_unprocessed_messages(
        &self,
        thread_id: i64,
    ) -> Result<Vec<ThreadMessage>, DatabaseError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .messages
            .iter()
            .filter(|m| m.thread_id == thread_id && !m.processed)
            .cloned()
            .collect())
    }

    async fn mark_messages_processed(&self, ids: &[i64]) -> Result<(), DatabaseError> {
        let mut inner = self.inner.lock().await;
        for message in inner.messages.iter_mut() {
            if ids.contains(&message.id) {
                message.processed = true;
            }
        }
        Ok(())
    }

    // --- Courses ---

    async fn create_course(
        &self,
        fiche_id: i64,
        thread_id: i64,
        trigger: CourseTrigger,
        status: CourseStatus,
        trace_id: Uuid,
    ) -> Result<Course, DatabaseError> {
        let mut inner = self.inner.lock().await;
        let started = matches!(status, CourseStatus::Running).then(Utc::now);
        let row = Course {
            id: inner.id(),
            fiche_id,
            thread_id,
            status,
            trigger,
            trace_id,
            continuation_of_course_id: None,
            started_at: started,
            finished_at: None,
            duration_ms: None,
            total_tokens: None,
            total_cost_usd: None,
            summary: None,
            error: None,
            created_at: Utc::now(),
        };
        inner.courses.push(row.clone());
        Ok(row)
    }

    async fn get_course(&self, id: i64) -> Result<Option<Course>, DatabaseError> {
        let inner = self.inner.lock().await;
        Ok(inner.courses.iter().find(|c| c.id == id).cloned())
    }

    async fn list_courses(
        &self,
        fiche_id: i64,
        owner_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Course>, DatabaseError> {
        let inner = self.inner.lock().await;
        let owned = |c: &Course| {
            owner_id.is_none_or(|o| {
                inner
                    .fiches
                    .iter()
                    .any(|f| f.id == c.fiche_id && f.owner_id == o)
            })
        };
        let mut rows: Vec<Course> = inner
            .courses
            .iter()
            .filter(|c| c.fiche_id == fiche_id && owned(c))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.id.cmp(&a.id));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn mark_course_running(&self, id: i64) -> Result<(), DatabaseError> {
        let mut inner = self.inner.lock().await;
        if let Some(course) = inner.course_mut(id) {
            course.status = CourseStatus::Running;
            course.started_at.get_or_insert_with(Utc::now);
        }
        Ok(())
    }

    async fn mark_course_deferred(&self, id: i64) -> Result<(), DatabaseError> {
        let mut inner = self.inner.lock().await;
        if let Some(course) = inner.course_mut(id) {
            course.status = CourseStatus::Deferred;
        }
        Ok(())
    }

    async fn mark_course_finished(
        &self,
        id: i64,
        totals: &CourseTotals,
    ) -> Result<(), DatabaseError> {
        let mut inner = self.inner.lock().await;
        if let Some(course) = inner.course_mut(id) {
            let now = Utc::now();
            course.status = CourseStatus::Success;
            course.finished_at = Some(now);
            course.duration_ms = course
                .started_at
                .map(|s| (now - s).num_milliseconds());
            course.total_tokens = totals.total_tokens;
            course.total_cost_usd = totals.total_cost_usd;
            course.summary = totals.summary.clone();
        }
        Ok(())
    }

    async fn mark_course_failed(&self, id: i64, error: &str) -> Result<(), DatabaseError> {
        let mut inner = self.inner.lock().await;
        if let Some(course) = inner.course_mut(id) {
            let now = Utc::now();
            course.status = CourseStatus::Failed;
            course.finished_at = Some(now);
            course.duration_ms = course
                .started_at
                .map(|s| (now - s).num_milliseconds());
            course.error = Some(error.to_string());
        }
        Ok(())
    }

    async fn find_continuation(&self, parent_id: i64) -> Result<Option<Course>, DatabaseError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .courses
            .iter()
            .find(|c| c.continuation_of_course_id == Some(parent_id))
            .cloned())
    }

    async fn create_continuation(
        &self,
        parent_id: i64,
        fiche_id: i64,
        thread_id: i64,
        trace_id: Uuid,
        tool_messages: &[NewThreadMessage],
    ) -> Result<(Course, bool), DatabaseError> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner
            .courses
            .iter()
            .find(|c| c.continuation_of_course_id == Some(parent_id))
        {
            return Ok((existing.clone(), false));
        }
        let row = Course {
            id: inner.id(),
            fiche_id,
            thread_id,
            status: CourseStatus::Queued,
            trigger: CourseTrigger::Continuation,
            trace_id,
            continuation_of_course_id: Some(parent_id),
            started_at: None,
            finished_at: None,
            duration_ms: None,
            total_tokens: None,
            total_cost_usd: None,
            summary: None,
            error: None,
            created_at: Utc::now(),
        };
        inner.courses.push(row.clone());
        for message in tool_messages {
            inner.insert_message(message);
        }
        Ok((row, true))
    }

    async fn list_running_courses(&self) -> Result<Vec<Course>, DatabaseError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .courses
            .iter()
            .filter(|c| c.status == CourseStatus::Running)
            .cloned()
            .collect())
    }

    // --- Course events ---

    async fn append_course_event(
        &self,
        course_id: i64,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> Result<CourseEvent, DatabaseError> {
        let mut inner = self.inner.lock().await;
        let seq = inner
            .course_events
            .iter()
            .filter(|e| e.course_id == course_id)
            .map(|e| e.seq)
            .max()
            .unwrap_or(0)
            + 1;
        let row = CourseEvent {
            id: inner.id(),
            course_id,
            seq,
            event_type: event_type.to_string(),
            payload: payload.clone(),
            created_at: Utc::now(),
        };
        inner.course_events.push(row.clone());
        Ok(row)
    }

    async fn list_course_events_after(
        &self,
        course_id: i64,
        after_seq: i64,
    ) -> Result<Vec<CourseEvent>, DatabaseError> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<CourseEvent> = inner
            .course_events
            .iter()
            .filter(|e| e.course_id == course_id && e.seq > after_seq)
            .cloned()
            .collect();
        rows.sort_by_key(|e| e.seq);
        Ok(rows)
    }

    // --- Commis jobs & barriers ---

    async fn create_commis_job(&self, job: &NewCommisJob) -> Result<CommisJob, DatabaseError> {
        let mut inner = self.inner.lock().await;
        let row = CommisJob {
            id: inner.id(),
            owner_id: job.owner_id,
            concierge_course_id: job.concierge_course_id,
            task: job.task.clone(),
            model: job.model.clone(),
            status: CommisStatus::Created,
            commis_id: job.commis_id.clone(),
            trace_id: job.trace_id,
            execution_mode: job.execution_mode.clone(),
            git_repo: job.git_repo.clone(),
            result_summary: None,
            artifacts_path: None,
            created_at: Utc::now(),
            finished_at: None,
        };
        inner.commis_jobs.push(row.clone());
        Ok(row)
    }

    async fn get_commis_job(&self, id: i64) -> Result<Option<CommisJob>, DatabaseError> {
        let inner = self.inner.lock().await;
        Ok(inner.commis_jobs.iter().find(|j| j.id == id).cloned())
    }

    async fn list_commis_jobs(
        &self,
        owner_id: Option<i64>,
    ) -> Result<Vec<CommisJob>, DatabaseError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .commis_jobs
            .iter()
            .filter(|j| owner_id.is_none_or(|o| j.owner_id == o))
            .cloned()
            .collect())
    }

    async fn update_commis_status(
        &self,
        id: i64,
        status: CommisStatus,
        result_summary: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let mut inner = self.inner.lock().await;
        if let Some(job) = inner.commis_jobs.iter_mut().find(|j| j.id == id) {
            job.status = status;
            if let Some(summary) = result_summary {
                job.result_summary = Some(summary.to_string());
            }
            if matches!(
                status,
                CommisStatus::Success | CommisStatus::Failed | CommisStatus::Cancelled
            ) {
                job.finished_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn commit_spawn(&self, course_id: i64, job_ids: &[i64]) -> Result<(), DatabaseError> {
        let mut inner = self.inner.lock().await;
        if inner.barriers.contains_key(&course_id) {
            return Err(DatabaseError::UniqueViolation(format!(
                "commis_barriers.course_id: {course_id}"
            )));
        }
        inner.barriers.insert(
            course_id,
            CommisBarrier {
                course_id,
                job_ids: job_ids.to_vec(),
                created_at: Utc::now(),
            },
        );
        for job in inner.commis_jobs.iter_mut() {
            if job_ids.contains(&job.id) && job.status == CommisStatus::Created {
                job.status = CommisStatus::Queued;
            }
        }
        if let Some(course) = inner.course_mut(course_id) {
            course.status = CourseStatus::Deferred;
        }
        Ok(())
    }

    async fn get_barrier(&self, course_id: i64) -> Result<Option<CommisBarrier>, DatabaseError> {
        let inner = self.inner.lock().await;
        Ok(inner.barriers.get(&course_id).cloned())
    }

    async fn barrier_remove_job(
        &self,
        course_id: i64,
        job_id: i64,
    ) -> Result<BarrierRelease, DatabaseError> {
        let mut inner = self.inner.lock().await;
        let Some(barrier) = inner.barriers.get_mut(&course_id) else {
            return Ok(BarrierRelease {
                remaining: 0,
                removed: false,
            });
        };
        let before = barrier.job_ids.len();
        barrier.job_ids.retain(|id| *id != job_id);
        let removed = barrier.job_ids.len() < before;
        let remaining = barrier.job_ids.len();
        if remaining == 0 {
            inner.barriers.remove(&course_id);
        }
        Ok(BarrierRelease { remaining, removed })
    }

    async fn delete_barrier(&self, course_id: i64) -> Result<(), DatabaseError> {
        let mut inner = self.inner.lock().await;
        inner.barriers.remove(&course_id);
        Ok(())
    }

    async fn list_barriers(&self) -> Result<Vec<CommisBarrier>, DatabaseError> {
        let inner = self.inner.lock().await;
        Ok(inner.barriers.values().cloned().collect())
    }

    // --- Runners & runner jobs ---

    async fn create_runner(
        &self,
        owner_id: i64,
        name: &str,
        auth_secret_hash: &str,
    ) -> Result<Runner, DatabaseError> {
        let mut inner = self.inner.lock().await;
        if inner
            .runners
            .iter()
            .any(|r| r.owner_id == owner_id && r.name == name)
        {
            return Err(DatabaseError::UniqueViolation(format!(
                "runners(owner_id, name): {name}"
            )));
        }
        let row = Runner {
            id: inner.id(),
            owner_id,
            name: name.to_string(),
            auth_secret_hash: auth_secret_hash.to_string(),
            status: RunnerStatus::Offline,
            last_heartbeat: None,
            created_at: Utc::now(),
        };
        inner.runners.push(row.clone());
        Ok(row)
    }

    async fn get_runner(&self, id: i64) -> Result<Option<Runner>, DatabaseError> {
        let inner = self.inner.lock().await;
        Ok(inner.runners.iter().find(|r| r.id == id).cloned())
    }

    async fn list_runners(&self, owner_id: Option<i64>) -> Result<Vec<Runner>, DatabaseError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .runners
            .iter()
            .filter(|r| owner_id.is_none_or(|o| r.owner_id == o))
            .cloned()
            .collect())
    }

    async fn set_runner_status(
        &self,
        id: i64,
        status: RunnerStatus,
        heartbeat: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError> {
        let mut inner = self.inner.lock().await;
        if let Some(runner) = inner.runners.iter_mut().find(|r| r.id == id) {
            runner.status = status;
            if heartbeat.is_some() {
                runner.last_heartbeat = heartbeat;
            }
        }
        Ok(())
    }

    async fn mark_all_runners_offline(&self) -> Result<u64, DatabaseError> {
        let mut inner = self.inner.lock().await;
        let mut flipped = 0;
        for runner in inner.runners.iter_mut() {
            if runner.status == RunnerStatus::Online {
                runner.status = RunnerStatus::Offline;
                flipped += 1;
            }
        }
        Ok(flipped)
    }

    async fn create_runner_job(&self, job: &RunnerJob) -> Result<(), DatabaseError> {
        let mut inner = self.inner.lock().await;
        inner.runner_jobs.push(job.clone());
        Ok(())
    }

    async fn get_runner_job(&self, id: Uuid) -> Result<Option<RunnerJob>, DatabaseError> {
        let inner = self.inner.lock().await;
        Ok(inner.runner_jobs.iter().find(|j| j.id == id).cloned())
    }

    async fn update_runner_job_status(
        &self,
        id: Uuid,
        status: RunnerJobStatus,
        exit_code: Option<i32>,
    ) -> Result<(), DatabaseError> {
        let mut inner = self.inner.lock().await;
        if let Some(job) = inner.runner_jobs.iter_mut().find(|j| j.id == id) {
            job.status = status;
            if exit_code.is_some() {
                job.exit_code = exit_code;
            }
            match status {
                RunnerJobStatus::Running => job.started_at = Some(Utc::now()),
                RunnerJobStatus::Success | RunnerJobStatus::Failed | RunnerJobStatus::Timeout => {
                    job.finished_at = Some(Utc::now());
                }
                RunnerJobStatus::Pending => {}
            }
        }
        Ok(())
    }

    async fn append_runner_job_output(
        &self,
        id: Uuid,
        stream: &str,
        data: &str,
    ) -> Result<(), DatabaseError> {
        let mut inner = self.inner.lock().await;
        if let Some(job) = inner.runner_jobs.iter_mut().find(|j| j.id == id) {
            let tail = if stream == "stderr" {
                &mut job.stderr_tail
            } else {
                &mut job.stdout_tail
            };
            tail.push_str(data);
            if tail.len() > 51200 {
                let cut = tail.len() - 51200;
                // Keep valid UTF-8 when trimming the head.
                let boundary = (cut..tail.len())
                    .find(|i| tail.is_char_boundary(*i))
                    .unwrap_or(tail.len());
                tail.drain(..boundary);
            }
        }
        Ok(())
    }

    // --- Job queue ---

    async fn enqueue(
        &self,
        job_id: &str,
        payload: &serde_json::Value,
        scheduled_for: DateTime<Utc>,
        dedupe_key: &str,
        max_attempts: i32,
    ) -> Result<EnqueueOutcome, DatabaseError> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner
            .queue
            .iter()
            .find(|e| e.job_id == job_id && e.dedupe_key == dedupe_key)
        {
            return Ok(EnqueueOutcome {
                entry_id: existing.id,
                newly_queued: false,
            });
        }
        let row = QueueEntry {
            id: inner.id(),
            job_id: job_id.to_string(),
            payload: payload.clone(),
            scheduled_for,
            dedupe_key: dedupe_key.to_string(),
            status: QueueStatus::Pending,
            attempts: 0,
            max_attempts,
            lease_owner: None,
            lease_expires_at: None,
            last_error: None,
            created_at: Utc::now(),
            finished_at: None,
        };
        let id = row.id;
        inner.queue.push(row);
        Ok(EnqueueOutcome {
            entry_id: id,
            newly_queued: true,
        })
    }

    async fn claim_queue_entry(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> Result<Option<QueueEntry>, DatabaseError> {
        let mut inner = self.inner.lock().await;
        let candidate = inner
            .queue
            .iter_mut()
            .filter(|e| e.status == QueueStatus::Pending && e.scheduled_for <= now)
            .min_by_key(|e| (e.scheduled_for, e.id));
        let Some(entry) = candidate else {
            return Ok(None);
        };
        entry.status = QueueStatus::Running;
        entry.lease_owner = Some(worker_id.to_string());
        entry.lease_expires_at = Some(now + lease);
        Ok(Some(entry.clone()))
    }

    async fn extend_lease(
        &self,
        entry_id: i64,
        worker_id: &str,
        until: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.queue.iter_mut().find(|e| {
            e.id == entry_id
                && e.status == QueueStatus::Running
                && e.lease_owner.as_deref() == Some(worker_id)
        }) {
            entry.lease_expires_at = Some(until);
            return Ok(true);
        }
        Ok(false)
    }

    async fn complete_queue_entry(&self, entry_id: i64) -> Result<(), DatabaseError> {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.queue.iter_mut().find(|e| e.id == entry_id) {
            entry.status = QueueStatus::Success;
            entry.finished_at = Some(Utc::now());
            entry.lease_owner = None;
            entry.lease_expires_at = None;
        }
        Ok(())
    }

    async fn fail_queue_entry(
        &self,
        entry_id: i64,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<FailOutcome, DatabaseError> {
        let mut inner = self.inner.lock().await;
        let entry = inner
            .queue
            .iter_mut()
            .find(|e| e.id == entry_id)
            .ok_or_else(|| DatabaseError::NotFound(format!("queue entry {entry_id}")))?;
        entry.attempts += 1;
        entry.last_error = Some(error.to_string());
        entry.lease_owner = None;
        entry.lease_expires_at = None;
        if entry.attempts < entry.max_attempts {
            entry.status = QueueStatus::Pending;
            entry.scheduled_for = retry_at;
            Ok(FailOutcome::Retrying {
                attempts: entry.attempts,
            })
        } else {
            entry.status = QueueStatus::Dead;
            entry.finished_at = Some(Utc::now());
            Ok(FailOutcome::Dead {
                attempts: entry.attempts,
            })
        }
    }

    async fn dead_letter_queue_entry(
        &self,
        entry_id: i64,
        error: &str,
    ) -> Result<(), DatabaseError> {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.queue.iter_mut().find(|e| e.id == entry_id) {
            entry.status = QueueStatus::Dead;
            entry.finished_at = Some(Utc::now());
            entry.last_error = Some(error.to_string());
            entry.lease_owner = None;
            entry.lease_expires_at = None;
        }
        Ok(())
    }

    async fn reset_zombie_entries(&self, now: DateTime<Utc>) -> Result<u64, DatabaseError> {
        let mut inner = self.inner.lock().await;
        let mut reset = 0;
        for entry in inner.queue.iter_mut() {
            if entry.status == QueueStatus::Running
                && entry.lease_expires_at.is_some_and(|at| at < now)
            {
                // The lost lease counts as one failed attempt.
                entry.attempts += 1;
                entry.lease_owner = None;
                entry.lease_expires_at = None;
                if entry.attempts < entry.max_attempts {
                    entry.status = QueueStatus::Pending;
                } else {
                    entry.status = QueueStatus::Dead;
                    entry.finished_at = Some(now);
                    entry.last_error = Some("lease expired".to_string());
                }
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn get_queue_entry(&self, entry_id: i64) -> Result<Option<QueueEntry>, DatabaseError> {
        let inner = self.inner.lock().await;
        Ok(inner.queue.iter().find(|e| e.id == entry_id).cloned())
    }

    async fn list_queue_entries(
        &self,
        job_id: Option<&str>,
        status: Option<QueueStatus>,
    ) -> Result<Vec<QueueEntry>, DatabaseError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .queue
            .iter()
            .filter(|e| job_id.is_none_or(|j| e.job_id == j))
            .filter(|e| status.is_none_or(|s| e.status == s))
            .cloned()
            .collect())
    }

    async fn latest_scheduled_for(
        &self,
        job_id: &str,
    ) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .queue
            .iter()
            .filter(|e| e.job_id == job_id)
            .map(|e| e.scheduled_for)
            .max())
    }

    // --- Triggers ---

    async fn create_trigger(
        &self,
        fiche_id: i64,
        kind: TriggerKind,
        secret_hash: &str,
    ) -> Result<TriggerRow, DatabaseError> {
        let mut inner = self.inner.lock().await;
        let row = TriggerRow {
            id: inner.id(),
            fiche_id,
            kind,
            secret_hash: secret_hash.to_string(),
            created_at: Utc::now(),
        };
        inner.triggers.push(row.clone());
        Ok(row)
    }

    async fn get_trigger(&self, id: i64) -> Result<Option<TriggerRow>, DatabaseError> {
        let inner = self.inner.lock().await;
        Ok(inner.triggers.iter().find(|t| t.id == id).cloned())
    }

    async fn delete_trigger(&self, id: i64) -> Result<bool, DatabaseError> {
        let mut inner = self.inner.lock().await;
        let before = inner.triggers.len();
        inner.triggers.retain(|t| t.id != id);
        Ok(inner.triggers.len() < before)
    }

    // --- Device tokens ---

    async fn upsert_device_token(
        &self,
        owner_id: i64,
        device_id: &str,
        token_hash: &str,
    ) -> Result<DeviceToken, DatabaseError> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner
            .device_tokens
            .iter_mut()
            .find(|t| t.device_id == device_id)
        {
            existing.owner_id = owner_id;
            existing.token_hash = token_hash.to_string();
            return Ok(existing.clone());
        }
        let row = DeviceToken {
            id: inner.id(),
            owner_id,
            device_id: device_id.to_string(),
            token_hash: token_hash.to_string(),
            created_at: Utc::now(),
        };
        inner.device_tokens.push(row.clone());
        Ok(row)
    }

    async fn find_device_token(
        &self,
        device_id: &str,
    ) -> Result<Option<DeviceToken>, DatabaseError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .device_tokens
            .iter()
            .find(|t| t.device_id == device_id)
            .cloned())
    }

    // --- Workflows ---

    async fn create_workflow(
        &self,
        owner_id: i64,
        name: &str,
        nodes: &[WorkflowNode],
    ) -> Result<Workflow, DatabaseError> {
        let mut inner = self.inner.lock().await;
        let row = Workflow {
            id: inner.id(),
            owner_id,
            name: name.to_string(),
            nodes: nodes.to_vec(),
            created_at: Utc::now(),
        };
        inner.workflows.push(row.clone());
        Ok(row)
    }

    async fn get_workflow(&self, id: i64) -> Result<Option<Workflow>, DatabaseError> {
        let inner = self.inner.lock().await;
        Ok(inner.workflows.iter().find(|w| w.id == id).cloned())
    }

    async fn list_workflows(&self, owner_id: Option<i64>) -> Result<Vec<Workflow>, DatabaseError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .workflows
            .iter()
            .filter(|w| owner_id.is_none_or(|o| w.owner_id == o))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seed(db: &MemoryDatabase) -> (i64, i64, i64) {
        let user = db.create_user("a@b.c", None, UserRole::User).await.unwrap();
        let fiche = db
            .create_fiche(&NewFiche::basic(user.id, "f", "gpt"))
            .await
            .unwrap();
        let thread = db
            .create_thread(fiche.id, user.id, "t", ThreadKind::Manual)
            .await
            .unwrap();
        (user.id, fiche.id, thread.id)
    }

    #[tokio::test]
    async fn continuation_is_unique_per_parent() {
        let db = MemoryDatabase::new();
        let (_, fiche_id, thread_id) = seed(&db).await;
        let parent = db
            .create_course(
                fiche_id,
                thread_id,
                CourseTrigger::Api,
                CourseStatus::Deferred,
                Uuid::new_v4(),
            )
            .await
            .unwrap();

        let msg = NewThreadMessage::tool(thread_id, "[Worker job 1] done", None);
        let (first, created_first) = db
            .create_continuation(parent.id, fiche_id, thread_id, Uuid::new_v4(), &[msg.clone()])
            .await
            .unwrap();
        let (second, created_second) = db
            .create_continuation(parent.id, fiche_id, thread_id, Uuid::new_v4(), &[msg])
            .await
            .unwrap();

        assert!(created_first);
        assert!(!created_second);
        assert_eq!(first.id, second.id);

        let tool_messages: Vec<_> = db
            .list_messages(thread_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|m| m.content.contains("[Worker job"))
            .collect();
        assert_eq!(tool_messages.len(), 1);
    }

    #[tokio::test]
    async fn course_event_seq_starts_at_one_and_increments() {
        let db = MemoryDatabase::new();
        let (_, fiche_id, thread_id) = seed(&db).await;
        let course = db
            .create_course(
                fiche_id,
                thread_id,
                CourseTrigger::Manual,
                CourseStatus::Running,
                Uuid::new_v4(),
            )
            .await
            .unwrap();

        for _ in 0..3 {
            db.append_course_event(course.id, "x", &serde_json::json!({}))
                .await
                .unwrap();
        }
        let events = db.list_course_events_after(course.id, 0).await.unwrap();
        let seqs: Vec<i64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn enqueue_dedupes_on_job_and_key() {
        let db = MemoryDatabase::new();
        let now = Utc::now();
        let first = db
            .enqueue("nightly", &serde_json::json!({}), now, "k1", 3)
            .await
            .unwrap();
        let second = db
            .enqueue("nightly", &serde_json::json!({}), now, "k1", 3)
            .await
            .unwrap();
        assert!(first.newly_queued);
        assert!(!second.newly_queued);
        assert_eq!(first.entry_id, second.entry_id);

        let pending = db
            .list_queue_entries(Some("nightly"), Some(QueueStatus::Pending))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 0);
    }

    #[tokio::test]
    async fn claim_skips_future_entries() {
        let db = MemoryDatabase::new();
        let now = Utc::now();
        db.enqueue(
            "later",
            &serde_json::json!({}),
            now + chrono::Duration::hours(1),
            "k",
            3,
        )
        .await
        .unwrap();
        let claimed = db
            .claim_queue_entry("w1", now, chrono::Duration::seconds(60))
            .await
            .unwrap();
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn zombie_reset_counts_one_failed_attempt() {
        let db = MemoryDatabase::new();
        let now = Utc::now();
        db.enqueue("job", &serde_json::json!({}), now, "k", 3)
            .await
            .unwrap();
        let entry = db
            .claim_queue_entry("w1", now, chrono::Duration::seconds(-1))
            .await
            .unwrap()
            .unwrap();
        // Lease already expired; the sweep recovers it and charges the
        // lost lease as one attempt.
        let reset = db.reset_zombie_entries(Utc::now()).await.unwrap();
        assert_eq!(reset, 1);
        let entry = db.get_queue_entry(entry.id).await.unwrap().unwrap();
        assert_eq!(entry.status, QueueStatus::Pending);
        assert_eq!(entry.attempts, 1);
        assert!(entry.lease_owner.is_none());
    }

    #[tokio::test]
    async fn zombie_with_exhausted_attempts_is_dead_lettered() {
        let db = MemoryDatabase::new();
        let now = Utc::now();
        db.enqueue("job", &serde_json::json!({}), now, "k", 1)
            .await
            .unwrap();
        db.claim_queue_entry("w1", now, chrono::Duration::seconds(-1))
            .await
            .unwrap()
            .unwrap();
        db.reset_zombie_entries(Utc::now()).await.unwrap();
        let entry = &db.list_queue_entries(Some("job"), None).await.unwrap()[0];
        assert_eq!(entry.status, QueueStatus::Dead);
        assert_eq!(entry.last_error.as_deref(), Some("lease expired"));
    }

    #[tokio::test]
    async fn device_token_upsert_replaces_hash() {
        let db = MemoryDatabase::new();
        let (owner, _, _) = seed(&db).await;

        let first = db.upsert_device_token(owner, "phone-1", "hash-a").await.unwrap();
        let second = db.upsert_device_token(owner, "phone-1", "hash-b").await.unwrap();
        assert_eq!(first.id, second.id);

        let found = db.find_device_token("phone-1").await.unwrap().unwrap();
        assert_eq!(found.token_hash, "hash-b");
        assert!(db.find_device_token("phone-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn barrier_release_deletes_when_empty() {
        let db = MemoryDatabase::new();
        let (_, fiche_id, thread_id) = seed(&db).await;
        let course = db
            .create_course(
                fiche_id,
                thread_id,
                CourseTrigger::Api,
                CourseStatus::Running,
                Uuid::new_v4(),
            )
            .await
            .unwrap();

        db.commit_spawn(course.id, &[10, 11]).await.unwrap();
        assert_eq!(
            db.get_course(course.id).await.unwrap().unwrap().status,
            CourseStatus::Deferred
        );

        let release = db.barrier_remove_job(course.id, 10).await.unwrap();
        assert_eq!(release.remaining, 1);
        assert!(release.removed);

        let release = db.barrier_remove_job(course.id, 11).await.unwrap();
        assert_eq!(release.remaining, 0);
        assert!(db.get_barrier(course.id).await.unwrap().is_none());
    }
}
