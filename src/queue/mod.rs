//! Durable job queue: at-least-once with dedup keys, leases, retries,
//! zombie recovery, and a cron scheduler with missed-run backfill.

pub mod registry;
mod scheduler;
mod worker;

pub use registry::{JobConfig, JobHandler, JobRegistry, parse_cron};
pub use scheduler::Scheduler;
pub use worker::QueueWorker;

use std::sync::Arc;

use chrono::{DateTime, Duration, DurationRound, Utc};
use sha2::{Digest, Sha256};

use crate::db::{Database, EnqueueOutcome};
use crate::error::QueueError;

/// Deterministic dedupe key: SHA-256 hex of
/// `"{job_id}|{scheduled_for_rfc3339_minute}"`.
pub fn minute_dedupe_key(job_id: &str, scheduled_for: DateTime<Utc>) -> String {
    let minute = scheduled_for
        .duration_trunc(Duration::minutes(1))
        .expect("minute truncation");
    let input = format!(
        "{job_id}|{}",
        minute.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    );
    let digest = Sha256::digest(input.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Thin façade over the datastore's queue operations; services enqueue
/// through this so key derivation stays in one place.
pub struct JobQueue {
    db: Arc<dyn Database>,
}

impl JobQueue {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Arc<dyn Database> {
        &self.db
    }

    /// Enqueue with an explicit dedupe key. The unique index decides; a
    /// conflicting insert reports `newly_queued = false`.
    pub async fn enqueue(
        &self,
        job_id: &str,
        payload: serde_json::Value,
        scheduled_for: DateTime<Utc>,
        dedupe_key: &str,
        max_attempts: i32,
    ) -> Result<EnqueueOutcome, QueueError> {
        let outcome = self
            .db
            .enqueue(job_id, &payload, scheduled_for, dedupe_key, max_attempts)
            .await?;
        if outcome.newly_queued {
            tracing::debug!(job_id, entry_id = outcome.entry_id, "enqueued");
        } else {
            tracing::debug!(job_id, entry_id = outcome.entry_id, "already queued");
        }
        Ok(outcome)
    }

    /// Enqueue keyed by the scheduled minute (the trigger/scheduler path).
    pub async fn enqueue_minute_keyed(
        &self,
        job_id: &str,
        payload: serde_json::Value,
        scheduled_for: DateTime<Utc>,
        max_attempts: i32,
    ) -> Result<EnqueueOutcome, QueueError> {
        let key = minute_dedupe_key(job_id, scheduled_for);
        self.enqueue(job_id, payload, scheduled_for, &key, max_attempts)
            .await
    }
}
