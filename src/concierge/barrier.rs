//! Barrier manager: "concierge waiting on N commis".
//!
//! Each commis completion removes its job from the barrier set and reports
//! onto the parent course stream. The release that empties the set creates
//! the continuation course. The unique index on
//! `continuation_of_course_id` makes that creation race-free, and the
//! worker tool messages ride in the same transaction so they appear
//! exactly once.

use std::sync::Arc;

use crate::db::Database;
use crate::error::ConciergeError;
use crate::events::{CourseEventLog, EventType};
use crate::models::{CommisJob, CommisStatus, Course, NewThreadMessage};

pub struct BarrierManager {
    db: Arc<dyn Database>,
    log: Arc<CourseEventLog>,
}

/// A continuation produced by the final release of a barrier.
#[derive(Debug, Clone)]
pub struct ContinuationReady {
    pub course: Course,
    /// True for the caller whose release inserted the row.
    pub created: bool,
}

impl BarrierManager {
    pub fn new(db: Arc<dyn Database>, log: Arc<CourseEventLog>) -> Self {
        Self { db, log }
    }

    /// Record a commis terminal state and release it from its barrier.
    ///
    /// Returns the continuation when this release emptied the barrier.
    pub async fn release(
        &self,
        job_id: i64,
        status: CommisStatus,
        summary: Option<&str>,
    ) -> Result<Option<ContinuationReady>, ConciergeError> {
        let Some(job) = self.db.get_commis_job(job_id).await? else {
            tracing::warn!(job_id, "release for unknown commis job");
            return Ok(None);
        };
        let parent_id = job.concierge_course_id;

        self.db.update_commis_status(job_id, status, summary).await?;

        let event_type = match status {
            CommisStatus::Success => EventType::CommisComplete,
            _ => EventType::CommisFailed,
        };
        let payload = serde_json::json!({
            "job_id": job_id,
            "commis_id": job.commis_id,
            "status": status,
            "summary": summary,
            "trace_id": job.trace_id,
        });
        if let Err(e) = self.log.append(parent_id, event_type, payload).await {
            tracing::warn!(job_id, "failed to emit commis completion event: {}", e);
        }

        let release = self.db.barrier_remove_job(parent_id, job_id).await?;
        if !release.removed {
            // Barrier already torn down (cascade cancel or duplicate
            // delivery); at-least-once makes this a normal path.
            tracing::debug!(job_id, course_id = parent_id, "no barrier held this job");
            return Ok(None);
        }
        if release.remaining > 0 {
            tracing::debug!(
                job_id,
                course_id = parent_id,
                remaining = release.remaining,
                "barrier not yet clear"
            );
            return Ok(None);
        }

        let parent = self
            .db
            .get_course(parent_id)
            .await?
            .ok_or(ConciergeError::CourseNotFound(parent_id))?;

        // Every terminal commis of the parent contributes its summary.
        let finished: Vec<CommisJob> = self
            .db
            .list_commis_jobs(Some(job.owner_id))
            .await?
            .into_iter()
            .filter(|j| {
                j.concierge_course_id == parent_id
                    && matches!(
                        j.status,
                        CommisStatus::Success | CommisStatus::Failed | CommisStatus::Cancelled
                    )
            })
            .collect();
        let tool_messages: Vec<NewThreadMessage> = finished
            .iter()
            .map(|j| worker_result_message(parent.thread_id, j))
            .collect();

        let (course, created) = self
            .db
            .create_continuation(
                parent_id,
                parent.fiche_id,
                parent.thread_id,
                parent.trace_id,
                &tool_messages,
            )
            .await?;

        tracing::info!(
            course_id = parent_id,
            continuation_id = course.id,
            created,
            "barrier cleared"
        );
        Ok(Some(ContinuationReady { course, created }))
    }

    /// Cascade teardown on explicit parent cancel: cancel every
    /// outstanding job and drop the barrier. No continuation is created.
    pub async fn cancel_all(&self, course_id: i64) -> Result<usize, ConciergeError> {
        let Some(barrier) = self.db.get_barrier(course_id).await? else {
            return Ok(0);
        };
        let cancelled = barrier.job_ids.len();
        for job_id in &barrier.job_ids {
            self.db
                .update_commis_status(*job_id, CommisStatus::Cancelled, Some("parent course cancelled"))
                .await?;
        }
        self.db.delete_barrier(course_id).await?;
        tracing::info!(course_id, cancelled, "cancelled outstanding commis");
        Ok(cancelled)
    }
}

/// The tool message injected with the continuation.
fn worker_result_message(thread_id: i64, job: &CommisJob) -> NewThreadMessage {
    let summary = job.result_summary.as_deref().unwrap_or("(no summary)");
    NewThreadMessage::tool(
        thread_id,
        format!(
            "[Worker job {} ({})] {}: {}",
            job.id, job.commis_id, job.status, summary
        ),
        None,
    )
}
