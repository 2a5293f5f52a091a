//! Runner job dispatch with per-runner concurrency control.
//!
//! One in-flight job per runner. Dispatch creates the job row, sends the
//! exec frame, and parks on a oneshot until the socket loop reports
//! exec_done/exec_error, or until the timeout plus a cancel grace period
//! expires.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::db::Database;
use crate::error::ErrorKind;
use crate::models::{RunnerJob, RunnerJobStatus};
use crate::tools::{envelope_error, envelope_ok};
use crate::transport::{RunnerConnectionManager, ServerMessage};

pub struct RunnerJobDispatcher {
    db: Arc<dyn Database>,
    connections: Arc<RunnerConnectionManager>,
    pending: Mutex<HashMap<Uuid, oneshot::Sender<serde_json::Value>>>,
    active: Mutex<HashMap<i64, Uuid>>,
    /// Cancel grace: how long after sending `cancel` before the job is
    /// declared timed out.
    grace: Duration,
}

impl RunnerJobDispatcher {
    pub fn new(db: Arc<dyn Database>, connections: Arc<RunnerConnectionManager>) -> Self {
        Self::with_grace(db, connections, Duration::from_secs(5))
    }

    pub fn with_grace(
        db: Arc<dyn Database>,
        connections: Arc<RunnerConnectionManager>,
        grace: Duration,
    ) -> Self {
        Self {
            db,
            connections,
            pending: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            grace,
        }
    }

    /// True when the runner has no active job.
    pub fn can_accept_job(&self, runner_id: i64) -> bool {
        !self.active.lock().expect("active lock").contains_key(&runner_id)
    }

    fn mark_job_active(&self, runner_id: i64, job_id: Uuid) {
        self.active.lock().expect("active lock").insert(runner_id, job_id);
        tracing::debug!(runner_id, job_id = %job_id, "marked job active");
    }

    fn clear_active_job(&self, runner_id: i64) {
        if let Some(job_id) = self.active.lock().expect("active lock").remove(&runner_id) {
            tracing::debug!(runner_id, job_id = %job_id, "cleared active job");
        }
    }

    fn take_pending(&self, job_id: Uuid) -> Option<oneshot::Sender<serde_json::Value>> {
        self.pending.lock().expect("pending lock").remove(&job_id)
    }

    /// The worker whose exec is currently running on a runner, if any.
    pub fn active_job(&self, runner_id: i64) -> Option<Uuid> {
        self.active.lock().expect("active lock").get(&runner_id).copied()
    }

    /// Dispatch a command to a runner and wait for completion.
    ///
    /// Always returns an envelope; infrastructure errors while recording
    /// the job row are the only hard failures.
    pub async fn dispatch_job(
        &self,
        owner_id: i64,
        runner_id: i64,
        command: &str,
        timeout_secs: i64,
        worker_id: Option<String>,
        course_id: Option<i64>,
    ) -> serde_json::Value {
        if !self.can_accept_job(runner_id) {
            return envelope_error(
                ErrorKind::ExecutionError,
                "Runner is busy with another job",
                serde_json::Value::Null,
            );
        }

        if !self.connections.is_online(runner_id) {
            return envelope_error(
                ErrorKind::ExecutionError,
                "Runner is offline",
                serde_json::Value::Null,
            );
        }

        let job = RunnerJob {
            id: Uuid::new_v4(),
            runner_id,
            owner_id,
            command: command.to_string(),
            timeout_secs,
            status: RunnerJobStatus::Running,
            stdout_tail: String::new(),
            stderr_tail: String::new(),
            exit_code: None,
            worker_id,
            course_id,
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            finished_at: None,
        };
        if let Err(e) = self.db.create_runner_job(&job).await {
            tracing::error!(runner_id, "failed to record runner job: {}", e);
            return envelope_error(
                ErrorKind::ExecutionError,
                "Failed to record runner job",
                serde_json::json!({"error": e.to_string()}),
            );
        }

        self.mark_job_active(runner_id, job.id);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("pending lock").insert(job.id, tx);

        let sent = self.connections.send_to_runner(
            runner_id,
            ServerMessage::ExecRequest {
                job_id: job.id,
                command: command.to_string(),
                timeout_secs,
            },
        );
        if !sent {
            self.take_pending(job.id);
            self.clear_active_job(runner_id);
            let _ = self
                .db
                .update_runner_job_status(job.id, RunnerJobStatus::Failed, None)
                .await;
            return envelope_error(
                ErrorKind::ExecutionError,
                "Failed to send command to runner",
                serde_json::Value::Null,
            );
        }

        let job_timeout = Duration::from_secs(timeout_secs.max(0) as u64);
        let result = match tokio::time::timeout(job_timeout, rx).await {
            Ok(Ok(result)) => Some(result),
            Ok(Err(_)) => None,
            Err(_) => {
                // Deadline passed: ask the runner to stop, then allow the
                // grace period for a late exec_done/exec_error.
                self.connections
                    .send_to_runner(runner_id, ServerMessage::Cancel { job_id: job.id });
                None
            }
        };

        match result {
            Some(result) => {
                self.clear_active_job(runner_id);
                result
            }
            None => {
                // Grace: wait once more for a straggler before declaring
                // the timeout.
                tokio::time::sleep(self.grace).await;
                self.take_pending(job.id);
                self.clear_active_job(runner_id);
                if let Ok(Some(row)) = self.db.get_runner_job(job.id).await {
                    if matches!(
                        row.status,
                        RunnerJobStatus::Success | RunnerJobStatus::Failed
                    ) {
                        // Completion raced the timeout; honor it.
                        return job_result_from_row(&row);
                    }
                }
                let _ = self
                    .db
                    .update_runner_job_status(job.id, RunnerJobStatus::Timeout, None)
                    .await;
                envelope_error(
                    ErrorKind::ExecutionError,
                    &format!("Job timed out after {timeout_secs} seconds"),
                    serde_json::json!({"job_id": job.id}),
                )
            }
        }
    }

    /// Resolve a pending dispatch. Called by the socket loop when
    /// exec_done/exec_error arrives (after it has updated the job row).
    pub fn complete_job(&self, job_id: Uuid, result: serde_json::Value, runner_id: Option<i64>) {
        if let Some(tx) = self.take_pending(job_id) {
            let _ = tx.send(result);
            tracing::debug!(job_id = %job_id, "completed runner job");
        }
        if let Some(runner_id) = runner_id {
            self.clear_active_job(runner_id);
        }
    }
}

/// Envelope for a finished job row.
pub(crate) fn job_result_from_row(row: &RunnerJob) -> serde_json::Value {
    match (row.status, row.exit_code) {
        (RunnerJobStatus::Success, code) => envelope_ok(serde_json::json!({
            "exit_code": code.unwrap_or(0),
            "stdout_tail": row.stdout_tail,
            "stderr_tail": row.stderr_tail,
        })),
        (_, code) => envelope_error(
            ErrorKind::ExecutionError,
            &format!("command exited with code {}", code.unwrap_or(-1)),
            serde_json::json!({
                "exit_code": code,
                "stdout_tail": row.stdout_tail,
                "stderr_tail": row.stderr_tail,
            }),
        ),
    }
}
