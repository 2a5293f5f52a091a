//! Crash recovery at startup.
//!
//! The database is the single source of truth; everything in memory is
//! rebuilt. Courses left running by a dead process fail, their barriers
//! tear down with their commis cancelled, expired queue leases reset, and
//! runners flip offline until they reconnect.

use std::sync::Arc;

use chrono::Utc;

use crate::db::Database;
use crate::error::DatabaseError;
use crate::events::{CourseEventLog, EventType};
use crate::models::{CommisStatus, CourseStatus};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub failed_courses: u64,
    pub torn_down_barriers: u64,
    pub cancelled_commis: u64,
    pub reset_queue_entries: u64,
    pub offlined_runners: u64,
}

pub async fn recover(
    db: &Arc<dyn Database>,
    log: &Arc<CourseEventLog>,
) -> Result<RecoveryReport, DatabaseError> {
    let mut report = RecoveryReport::default();

    // 1. Running courses have no surviving task.
    let interrupted = db.list_running_courses().await?;
    let mut failed_ids = Vec::new();
    for course in interrupted {
        db.mark_course_failed(course.id, "process restarted during run")
            .await?;
        let _ = log
            .append(
                course.id,
                EventType::Error,
                serde_json::json!({
                    "error_type": "execution_error",
                    "user_message": "process restarted during run",
                }),
            )
            .await;
        failed_ids.push(course.id);
        report.failed_courses += 1;
    }

    // 2. Barriers under those failed courses come down; deferred courses
    //    keep theirs; their continuations arrive through the queue.
    for barrier in db.list_barriers().await? {
        let parent_failed = failed_ids.contains(&barrier.course_id)
            || db
                .get_course(barrier.course_id)
                .await?
                .is_none_or(|c| c.status == CourseStatus::Failed);
        if !parent_failed {
            continue;
        }
        for job_id in &barrier.job_ids {
            db.update_commis_status(*job_id, CommisStatus::Cancelled, Some("process restarted"))
                .await?;
            report.cancelled_commis += 1;
        }
        db.delete_barrier(barrier.course_id).await?;
        report.torn_down_barriers += 1;
    }

    // 3. Expired leases surrender their entries.
    report.reset_queue_entries = db.reset_zombie_entries(Utc::now()).await?;

    // 4. Runners are offline until they say hello again.
    report.offlined_runners = db.mark_all_runners_offline().await?;

    tracing::info!(
        failed_courses = report.failed_courses,
        barriers = report.torn_down_barriers,
        commis = report.cancelled_commis,
        queue_entries = report.reset_queue_entries,
        runners = report.offlined_runners,
        "startup recovery complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use uuid::Uuid;

    use super::*;
    use crate::db::{MemoryDatabase, NewCommisJob};
    use crate::events::EventBus;
    use crate::models::{CourseTrigger, NewFiche, QueueStatus, RunnerStatus, ThreadKind, UserRole};

    async fn harness() -> (Arc<dyn Database>, Arc<CourseEventLog>) {
        let db: Arc<dyn Database> = Arc::new(MemoryDatabase::new());
        let log = Arc::new(CourseEventLog::new(Arc::clone(&db), Arc::new(EventBus::new())));
        (db, log)
    }

    #[tokio::test]
    async fn recovery_settles_every_orphan() {
        let (db, log) = harness().await;
        let user = db.create_user("o@x.y", None, UserRole::User).await.unwrap();
        let fiche = db
            .create_fiche(&NewFiche::basic(user.id, "f", "gpt"))
            .await
            .unwrap();
        let thread = db
            .create_thread(fiche.id, user.id, "t", ThreadKind::Concierge)
            .await
            .unwrap();

        // A course left running with a barrier and a pending commis.
        let orphan = db
            .create_course(
                fiche.id,
                thread.id,
                CourseTrigger::Api,
                CourseStatus::Running,
                Uuid::new_v4(),
            )
            .await
            .unwrap();
        let job = db
            .create_commis_job(&NewCommisJob {
                owner_id: user.id,
                concierge_course_id: orphan.id,
                task: "t".to_string(),
                model: "gpt".to_string(),
                commis_id: "commis-x".to_string(),
                trace_id: Uuid::new_v4(),
                execution_mode: "plain".to_string(),
                git_repo: None,
            })
            .await
            .unwrap();
        db.commit_spawn(orphan.id, &[job.id]).await.unwrap();
        // commit_spawn marked it deferred; simulate the crash mid-run.
        db.mark_course_running(orphan.id).await.unwrap();

        // A healthy deferred course whose barrier must survive.
        let deferred = db
            .create_course(
                fiche.id,
                thread.id,
                CourseTrigger::Api,
                CourseStatus::Running,
                Uuid::new_v4(),
            )
            .await
            .unwrap();
        let job2 = db
            .create_commis_job(&NewCommisJob {
                owner_id: user.id,
                concierge_course_id: deferred.id,
                task: "t".to_string(),
                model: "gpt".to_string(),
                commis_id: "commis-y".to_string(),
                trace_id: Uuid::new_v4(),
                execution_mode: "plain".to_string(),
                git_repo: None,
            })
            .await
            .unwrap();
        db.commit_spawn(deferred.id, &[job2.id]).await.unwrap();

        // A zombie queue entry and an online runner.
        db.enqueue("job", &serde_json::json!({}), Utc::now(), "k", 3)
            .await
            .unwrap();
        db.claim_queue_entry("dead-worker", Utc::now(), Duration::seconds(-5))
            .await
            .unwrap();
        let runner = db.create_runner(user.id, "cube", "hash").await.unwrap();
        db.set_runner_status(runner.id, RunnerStatus::Online, Some(Utc::now()))
            .await
            .unwrap();

        let report = recover(&db, &log).await.unwrap();

        assert_eq!(report.failed_courses, 1);
        assert_eq!(report.torn_down_barriers, 1);
        assert_eq!(report.cancelled_commis, 1);
        assert_eq!(report.reset_queue_entries, 1);
        assert_eq!(report.offlined_runners, 1);

        // Orphan failed and its commis cancelled; the deferred survivor
        // keeps its barrier.
        let orphan = db.get_course(orphan.id).await.unwrap().unwrap();
        assert_eq!(orphan.status, CourseStatus::Failed);
        assert!(db.get_barrier(orphan.id).await.unwrap().is_none());
        assert_eq!(
            db.get_commis_job(job.id).await.unwrap().unwrap().status,
            CommisStatus::Cancelled
        );
        assert!(db.get_barrier(deferred.id).await.unwrap().is_some());

        let entries = db
            .list_queue_entries(None, Some(QueueStatus::Pending))
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(
            db.get_runner(runner.id).await.unwrap().unwrap().status,
            RunnerStatus::Offline
        );
    }
}
