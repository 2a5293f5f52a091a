//! Built-in registered jobs: course execution, the fiche schedule sweep,
//! and queue health alerting.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use secrecy::SecretString;
use uuid::Uuid;

use crate::concierge::ConciergeService;
use crate::db::Database;
use crate::error::QueueError;
use crate::events::{EventBus, EventType};
use crate::models::{CourseStatus, CourseTrigger, QueueStatus, ThreadKind};
use crate::queue::registry::parse_cron;
use crate::queue::{JobConfig, JobHandler, JobQueue, JobRegistry};

/// Registry key for the generic course execution job.
pub const FICHE_RUN_JOB_ID: &str = "fiche_run";
/// Registry key for the per-minute fiche schedule sweep.
pub const FICHE_SCHEDULE_SWEEP_JOB_ID: &str = "fiche_schedule_sweep";
/// Registry key for the queue health monitor.
pub const QUEUE_HEALTH_JOB_ID: &str = "queue_health";

/// Dedupe key for a course execution entry: one entry per course, ever.
pub fn course_dedupe_key(course_id: i64) -> String {
    format!("course-{course_id}")
}

/// Executes one queued course through the regular course execution path.
pub struct FicheRunJob {
    db: Arc<dyn Database>,
    concierge: Arc<ConciergeService>,
}

impl FicheRunJob {
    pub fn new(db: Arc<dyn Database>, concierge: Arc<ConciergeService>) -> Self {
        Self { db, concierge }
    }
}

#[async_trait]
impl JobHandler for FicheRunJob {
    async fn run(
        &self,
        payload: &serde_json::Value,
        _secrets: &HashMap<String, SecretString>,
    ) -> Result<(), QueueError> {
        let course_id = payload
            .get("course_id")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| QueueError::Execution("payload missing course_id".to_string()))?;
        let course = self
            .db
            .get_course(course_id)
            .await?
            .ok_or_else(|| QueueError::Execution(format!("course {course_id} not found")))?;

        // At-least-once: a redelivered terminal course is a no-op.
        if matches!(course.status, CourseStatus::Success | CourseStatus::Failed) {
            return Ok(());
        }

        Arc::clone(&self.concierge).execute_course(course).await;
        Ok(())
    }
}

/// Per-minute sweep turning fiche cron schedules into queued courses.
///
/// Each due fire creates a fresh schedule thread plus a queued course and
/// enqueues its execution; the minute dedupe key on the sweep itself and
/// the course key on the execution entry keep doubles out.
pub struct FicheScheduleSweep {
    db: Arc<dyn Database>,
    queue: Arc<JobQueue>,
}

impl FicheScheduleSweep {
    pub fn new(db: Arc<dyn Database>, queue: Arc<JobQueue>) -> Self {
        Self { db, queue }
    }
}

#[async_trait]
impl JobHandler for FicheScheduleSweep {
    async fn run(
        &self,
        _payload: &serde_json::Value,
        _secrets: &HashMap<String, SecretString>,
    ) -> Result<(), QueueError> {
        let now = Utc::now();
        let window_start = now - Duration::seconds(60);

        for fiche in self.db.list_scheduled_fiches().await? {
            let Some(expr) = fiche.schedule.as_deref() else { continue };
            let schedule = match parse_cron(expr) {
                Ok(schedule) => schedule,
                Err(e) => {
                    tracing::warn!(fiche_id = fiche.id, "skipping bad schedule: {}", e);
                    continue;
                }
            };
            let due = schedule.after(&window_start).take_while(|t| *t <= now).count() > 0;
            if !due {
                continue;
            }

            let thread = self
                .db
                .create_thread(fiche.id, fiche.owner_id, &fiche.name, ThreadKind::Schedule)
                .await?;
            let course = self
                .db
                .create_course(
                    fiche.id,
                    thread.id,
                    CourseTrigger::Schedule,
                    CourseStatus::Queued,
                    Uuid::new_v4(),
                )
                .await?;
            self.queue
                .enqueue(
                    FICHE_RUN_JOB_ID,
                    serde_json::json!({"course_id": course.id}),
                    now,
                    &course_dedupe_key(course.id),
                    3,
                )
                .await?;
            tracing::info!(fiche_id = fiche.id, course_id = course.id, "scheduled fiche fired");
        }
        Ok(())
    }
}

/// Scans for recently dead-lettered entries and raises one alert event
/// summarizing them. Delivery (email or otherwise) hangs off the bus.
pub struct QueueHealthJob {
    db: Arc<dyn Database>,
    bus: Arc<EventBus>,
}

impl QueueHealthJob {
    pub fn new(db: Arc<dyn Database>, bus: Arc<EventBus>) -> Self {
        Self { db, bus }
    }
}

#[async_trait]
impl JobHandler for QueueHealthJob {
    async fn run(
        &self,
        _payload: &serde_json::Value,
        _secrets: &HashMap<String, SecretString>,
    ) -> Result<(), QueueError> {
        let dead = self
            .db
            .list_queue_entries(None, Some(QueueStatus::Dead))
            .await?;
        let cutoff = Utc::now() - Duration::hours(24);
        let recent: Vec<_> = dead
            .iter()
            .filter(|e| e.finished_at.is_some_and(|at| at > cutoff))
            .collect();
        if recent.is_empty() {
            return Ok(());
        }

        let summary: Vec<serde_json::Value> = recent
            .iter()
            .map(|e| {
                serde_json::json!({
                    "job_id": e.job_id,
                    "attempts": e.attempts,
                    "last_error": e.last_error,
                })
            })
            .collect();
        tracing::warn!(dead = recent.len(), "dead-lettered jobs in the last 24h");
        self.bus
            .publish(
                EventType::Error,
                serde_json::json!({
                    "error_type": "execution_error",
                    "user_message": format!("{} job(s) dead-lettered in the last 24h", recent.len()),
                    "dead_jobs": summary,
                }),
            )
            .await;
        Ok(())
    }
}

/// The standard registry wiring for one process.
pub fn build_registry(
    db: Arc<dyn Database>,
    queue: Arc<JobQueue>,
    bus: Arc<EventBus>,
    concierge: Arc<ConciergeService>,
    commis_runner: Arc<crate::commis::CommisRunner>,
) -> JobRegistry {
    JobRegistry::new()
        .register(JobConfig::new(
            FICHE_RUN_JOB_ID,
            "Execute one queued course",
            Arc::new(FicheRunJob::new(Arc::clone(&db), concierge)),
        ))
        .register(
            JobConfig::new(
                crate::concierge::COMMIS_JOB_ID,
                "Run a queued commis job",
                commis_runner,
            )
            .with_max_attempts(3),
        )
        .register(
            JobConfig::new(
                FICHE_SCHEDULE_SWEEP_JOB_ID,
                "Expand fiche cron schedules into courses",
                Arc::new(FicheScheduleSweep::new(Arc::clone(&db), queue)),
            )
            .with_schedule("* * * * *")
            .with_max_attempts(1),
        )
        .register(
            JobConfig::new(
                QUEUE_HEALTH_JOB_ID,
                "Alert on repeatedly failing jobs",
                Arc::new(QueueHealthJob::new(db, bus)),
            )
            .with_schedule("0 * * * *"),
        )
}
