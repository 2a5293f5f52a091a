//! Queue worker: claim, execute, heartbeat, settle.
//!
//! Consumers are idempotent by contract; the queue is at-least-once. A
//! worker that dies mid-job surrenders the entry via lease expiry and the
//! zombie sweep counts that as one failed attempt.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use secrecy::SecretString;

use crate::credentials::CredentialResolver;
use crate::db::{Database, FailOutcome};
use crate::error::QueueError;
use crate::events::{EventBus, EventType};
use crate::queue::{JobQueue, JobRegistry};

/// System owner id used when resolving job secrets.
const SYSTEM_OWNER: i64 = 0;
/// Base retry backoff; doubles per attempt.
const BACKOFF_BASE_SECS: i64 = 30;

pub struct QueueWorker {
    worker_id: String,
    queue: Arc<JobQueue>,
    registry: Arc<JobRegistry>,
    secrets: Arc<dyn CredentialResolver>,
    bus: Arc<EventBus>,
    lease: chrono::Duration,
    poll_interval: Duration,
}

impl QueueWorker {
    pub fn new(
        worker_id: impl Into<String>,
        queue: Arc<JobQueue>,
        registry: Arc<JobRegistry>,
        secrets: Arc<dyn CredentialResolver>,
        bus: Arc<EventBus>,
        lease: chrono::Duration,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            queue,
            registry,
            secrets,
            bus,
            lease,
            poll_interval: Duration::from_millis(500),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Claim and execute at most one entry. Returns whether one ran.
    pub async fn run_once(&self) -> Result<bool, QueueError> {
        let Some(entry) = self
            .queue
            .db()
            .claim_queue_entry(&self.worker_id, Utc::now(), self.lease)
            .await?
        else {
            return Ok(false);
        };

        tracing::info!(
            worker_id = %self.worker_id,
            job_id = %entry.job_id,
            entry_id = entry.id,
            attempts = entry.attempts,
            "claimed queue entry"
        );

        let Some(config) = self.registry.get(&entry.job_id) else {
            self.queue
                .db()
                .dead_letter_queue_entry(entry.id, &format!("unknown job id: {}", entry.job_id))
                .await?;
            return Ok(true);
        };

        // Required-secrets guard: missing secrets drop the entry, no retry.
        let mut secrets: HashMap<String, SecretString> = HashMap::new();
        let mut missing: Vec<&str> = Vec::new();
        for key in &config.required_secrets {
            match self.secrets.resolve(SYSTEM_OWNER, key).await {
                Some(value) => {
                    secrets.insert(key.clone(), value);
                }
                None => missing.push(key),
            }
        }
        if !missing.is_empty() {
            let error = format!("missing required secrets: {}", missing.join(", "));
            tracing::error!(job_id = %entry.job_id, "{}", error);
            self.queue
                .db()
                .dead_letter_queue_entry(entry.id, &error)
                .await?;
            self.bus
                .publish(
                    EventType::Error,
                    serde_json::json!({
                        "error_type": "execution_error",
                        "user_message": error,
                        "job_id": entry.job_id,
                    }),
                )
                .await;
            return Ok(true);
        }

        // Heartbeat: extend the lease at half-life while the handler runs.
        let heartbeat = {
            let db = Arc::clone(self.queue.db());
            let worker_id = self.worker_id.clone();
            let lease = self.lease;
            let entry_id = entry.id;
            tokio::spawn(async move {
                let half_life = Duration::from_millis((lease.num_milliseconds().max(2) / 2) as u64);
                let mut tick = tokio::time::interval(half_life);
                tick.tick().await;
                loop {
                    tick.tick().await;
                    match db.extend_lease(entry_id, &worker_id, Utc::now() + lease).await {
                        Ok(true) => {}
                        // Lease lost: stop heartbeating, the sweep owns it.
                        Ok(false) | Err(_) => break,
                    }
                }
            })
        };

        let result = config.handler.run(&entry.payload, &secrets).await;
        heartbeat.abort();

        match result {
            Ok(()) => {
                self.queue.db().complete_queue_entry(entry.id).await?;
                tracing::info!(job_id = %entry.job_id, entry_id = entry.id, "queue entry succeeded");
            }
            Err(e) => {
                let backoff =
                    chrono::Duration::seconds(BACKOFF_BASE_SECS << entry.attempts.min(8) as i64);
                let outcome = self
                    .queue
                    .db()
                    .fail_queue_entry(entry.id, &e.to_string(), Utc::now() + backoff)
                    .await?;
                match outcome {
                    FailOutcome::Retrying { attempts } => {
                        tracing::warn!(
                            job_id = %entry.job_id,
                            attempts,
                            "queue entry failed, retrying: {}",
                            e
                        );
                    }
                    FailOutcome::Dead { attempts } => {
                        tracing::error!(
                            job_id = %entry.job_id,
                            attempts,
                            "queue entry dead-lettered: {}",
                            e
                        );
                        self.bus
                            .publish(
                                EventType::Error,
                                serde_json::json!({
                                    "error_type": "execution_error",
                                    "user_message": format!(
                                        "job {} exhausted {} attempts", entry.job_id, attempts
                                    ),
                                    "job_id": entry.job_id,
                                }),
                            )
                            .await;
                    }
                }
            }
        }
        Ok(true)
    }

    /// Worker loop: drain while entries are due, then poll.
    pub async fn run(self: Arc<Self>) {
        loop {
            match self.run_once().await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(self.poll_interval).await,
                Err(e) => {
                    tracing::error!(worker_id = %self.worker_id, "worker iteration failed: {}", e);
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::credentials::StaticCredentials;
    use crate::db::{Database, MemoryDatabase};
    use crate::models::QueueStatus;
    use crate::queue::registry::{JobConfig, JobHandler};

    struct CountingHandler {
        calls: Arc<AtomicUsize>,
        fail_times: usize,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn run(
            &self,
            _payload: &serde_json::Value,
            _secrets: &HashMap<String, SecretString>,
        ) -> Result<(), QueueError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                return Err(QueueError::Execution("transient".to_string()));
            }
            Ok(())
        }
    }

    fn worker_with(
        db: Arc<MemoryDatabase>,
        registry: JobRegistry,
        secrets: StaticCredentials,
    ) -> QueueWorker {
        QueueWorker::new(
            "w1",
            Arc::new(JobQueue::new(db)),
            Arc::new(registry),
            Arc::new(secrets),
            Arc::new(EventBus::new()),
            chrono::Duration::seconds(60),
        )
    }

    #[tokio::test]
    async fn empty_queue_returns_quickly() {
        let db = Arc::new(MemoryDatabase::new());
        let worker = worker_with(Arc::clone(&db), JobRegistry::new(), StaticCredentials::new());
        assert!(!worker.run_once().await.unwrap());
    }

    #[tokio::test]
    async fn successful_job_completes_entry() {
        let db = Arc::new(MemoryDatabase::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = JobRegistry::new().register(JobConfig::new(
            "ok-job",
            "test",
            Arc::new(CountingHandler {
                calls: Arc::clone(&calls),
                fail_times: 0,
            }),
        ));
        let worker = worker_with(Arc::clone(&db), registry, StaticCredentials::new());

        db.enqueue("ok-job", &serde_json::json!({}), Utc::now(), "k", 3)
            .await
            .unwrap();
        assert!(worker.run_once().await.unwrap());

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let done = db
            .list_queue_entries(Some("ok-job"), Some(QueueStatus::Success))
            .await
            .unwrap();
        assert_eq!(done.len(), 1);
    }

    #[tokio::test]
    async fn failure_retries_with_backoff_then_dies() {
        let db = Arc::new(MemoryDatabase::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = JobRegistry::new().register(JobConfig::new(
            "flaky",
            "test",
            Arc::new(CountingHandler {
                calls: Arc::clone(&calls),
                fail_times: usize::MAX,
            }),
        ));
        let worker = worker_with(Arc::clone(&db), registry, StaticCredentials::new());

        db.enqueue("flaky", &serde_json::json!({}), Utc::now(), "k", 2)
            .await
            .unwrap();

        // First attempt: fails, resets to pending with backoff.
        assert!(worker.run_once().await.unwrap());
        let entry = &db.list_queue_entries(Some("flaky"), None).await.unwrap()[0];
        assert_eq!(entry.status, QueueStatus::Pending);
        assert_eq!(entry.attempts, 1);
        assert!(entry.scheduled_for > Utc::now());

        // Force it due again; second attempt exhausts max_attempts.
        let id = entry.id;
        db.fail_queue_entry(id, "noop", Utc::now()).await.ok();
        let entry = db.get_queue_entry(id).await.unwrap().unwrap();
        assert_eq!(entry.status, QueueStatus::Dead);
    }

    #[tokio::test]
    async fn missing_secrets_dead_letter_without_retry() {
        let db = Arc::new(MemoryDatabase::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = JobRegistry::new().register(
            JobConfig::new(
                "secretive",
                "test",
                Arc::new(CountingHandler {
                    calls: Arc::clone(&calls),
                    fail_times: 0,
                }),
            )
            .with_required_secrets(vec!["api_key".to_string()]),
        );
        let worker = worker_with(Arc::clone(&db), registry, StaticCredentials::new());

        db.enqueue("secretive", &serde_json::json!({}), Utc::now(), "k", 3)
            .await
            .unwrap();
        assert!(worker.run_once().await.unwrap());

        // Handler never ran; entry is dead with the error recorded.
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let entry = &db.list_queue_entries(Some("secretive"), None).await.unwrap()[0];
        assert_eq!(entry.status, QueueStatus::Dead);
        assert!(entry.last_error.as_ref().unwrap().contains("missing required secrets"));
        assert_eq!(entry.attempts, 0);
    }

    #[tokio::test]
    async fn unknown_job_is_dead_lettered() {
        let db = Arc::new(MemoryDatabase::new());
        let worker = worker_with(Arc::clone(&db), JobRegistry::new(), StaticCredentials::new());
        db.enqueue("ghost", &serde_json::json!({}), Utc::now(), "k", 3)
            .await
            .unwrap();
        assert!(worker.run_once().await.unwrap());
        let entry = &db.list_queue_entries(Some("ghost"), None).await.unwrap()[0];
        assert_eq!(entry.status, QueueStatus::Dead);
    }
}
