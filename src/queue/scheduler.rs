//! Cron-driven enqueue with missed-run backfill.
//!
//! Each tick expands every enabled job's cron expression over the lookahead
//! horizon and enqueues one entry per expected fire; the minute dedupe key
//! makes re-enqueueing a no-op. On startup, fires the installation slept
//! through are backfilled within the configured window.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::db::Database;
use crate::error::QueueError;
use crate::queue::registry::parse_cron;
use crate::queue::{JobQueue, JobRegistry};

pub struct Scheduler {
    queue: Arc<JobQueue>,
    registry: Arc<JobRegistry>,
    /// How far ahead each tick schedules.
    lookahead: chrono::Duration,
    /// How far back startup backfill reaches.
    backfill_window: chrono::Duration,
    tick_interval: Duration,
}

impl Scheduler {
    pub fn new(queue: Arc<JobQueue>, registry: Arc<JobRegistry>) -> Self {
        Self {
            queue,
            registry,
            lookahead: chrono::Duration::minutes(5),
            backfill_window: chrono::Duration::hours(6),
            tick_interval: Duration::from_secs(60),
        }
    }

    pub fn with_backfill_window(mut self, window: chrono::Duration) -> Self {
        self.backfill_window = window;
        self
    }

    pub fn with_lookahead(mut self, lookahead: chrono::Duration) -> Self {
        self.lookahead = lookahead;
        self
    }

    /// Enqueue every expected fire in `(after, until]` for one job.
    async fn enqueue_fires(
        &self,
        job_id: &str,
        cron_expr: &str,
        max_attempts: i32,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<u64, QueueError> {
        let schedule = parse_cron(cron_expr)?;
        let mut enqueued = 0;
        for fire in schedule.after(&after) {
            if fire > until {
                break;
            }
            let outcome = self
                .queue
                .enqueue_minute_keyed(job_id, serde_json::json!({}), fire, max_attempts)
                .await?;
            if outcome.newly_queued {
                enqueued += 1;
            }
        }
        Ok(enqueued)
    }

    /// One scheduler pass over all registered cron jobs.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<u64, QueueError> {
        let mut total = 0;
        for job in self.registry.scheduled() {
            let cron_expr = job.schedule.as_deref().expect("scheduled() filters");
            match self
                .enqueue_fires(&job.job_id, cron_expr, job.max_attempts, now, now + self.lookahead)
                .await
            {
                Ok(n) => total += n,
                Err(e) => {
                    tracing::error!(job_id = %job.job_id, "scheduler tick failed: {}", e);
                }
            }
        }
        Ok(total)
    }

    /// Startup backfill: one catch-up entry per expected fire the queue has
    /// no record of, bounded by the backfill window.
    pub async fn backfill_missed(&self, now: DateTime<Utc>) -> Result<u64, QueueError> {
        let mut total = 0;
        for job in self.registry.scheduled() {
            let cron_expr = job.schedule.as_deref().expect("scheduled() filters");
            let anchor = self
                .queue
                .db()
                .latest_scheduled_for(&job.job_id)
                .await?
                .unwrap_or(now - self.backfill_window)
                .max(now - self.backfill_window);
            match self
                .enqueue_fires(&job.job_id, cron_expr, job.max_attempts, anchor, now)
                .await
            {
                Ok(n) => {
                    if n > 0 {
                        tracing::info!(job_id = %job.job_id, missed = n, "backfilled missed runs");
                    }
                    total += n;
                }
                Err(e) => {
                    tracing::error!(job_id = %job.job_id, "backfill failed: {}", e);
                }
            }
        }
        Ok(total)
    }

    /// Periodic loop: tick plus zombie sweep.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.tick_interval);
        loop {
            interval.tick().await;
            let now = Utc::now();
            if let Err(e) = self.tick(now).await {
                tracing::error!("scheduler tick error: {}", e);
            }
            match self.queue.db().reset_zombie_entries(now).await {
                Ok(0) => {}
                Ok(n) => tracing::warn!(recovered = n, "reset zombie queue entries"),
                Err(e) => tracing::error!("zombie sweep failed: {}", e),
            }
        }
    }
}
