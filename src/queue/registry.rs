//! In-process registry of named jobs.
//!
//! A job couples a handler with its schedule, retry budget, and the
//! secrets it requires. The registry is assembled at startup (plus on
//! `/sync` reconciliation) and handed to the scheduler and workers.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretString;

use crate::error::QueueError;

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(
        &self,
        payload: &serde_json::Value,
        secrets: &HashMap<String, SecretString>,
    ) -> Result<(), QueueError>;
}

/// Configuration for one registered job.
#[derive(Clone)]
pub struct JobConfig {
    pub job_id: String,
    pub description: String,
    /// Standard 5-field cron expression; None for on-demand jobs
    /// (commis execution, webhook-triggered work).
    pub schedule: Option<String>,
    pub enabled: bool,
    pub required_secrets: Vec<String>,
    pub max_attempts: i32,
    pub handler: Arc<dyn JobHandler>,
}

impl JobConfig {
    pub fn new(
        job_id: impl Into<String>,
        description: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            description: description.into(),
            schedule: None,
            enabled: true,
            required_secrets: Vec::new(),
            max_attempts: 3,
            handler,
        }
    }

    pub fn with_schedule(mut self, cron_expr: impl Into<String>) -> Self {
        self.schedule = Some(cron_expr.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_required_secrets(mut self, secrets: Vec<String>) -> Self {
        self.required_secrets = secrets;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

/// Immutable job_id -> config map.
#[derive(Default)]
pub struct JobRegistry {
    jobs: BTreeMap<String, JobConfig>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, config: JobConfig) -> Self {
        self.jobs.insert(config.job_id.clone(), config);
        self
    }

    pub fn get(&self, job_id: &str) -> Option<&JobConfig> {
        self.jobs.get(job_id)
    }

    pub fn all(&self) -> impl Iterator<Item = &JobConfig> {
        self.jobs.values()
    }

    pub fn scheduled(&self) -> impl Iterator<Item = &JobConfig> {
        self.jobs
            .values()
            .filter(|j| j.enabled && j.schedule.is_some())
    }
}

/// Parse a standard 5-field cron expression (the `cron` crate wants a
/// seconds field, so one is prepended).
pub fn parse_cron(expr: &str) -> Result<cron::Schedule, QueueError> {
    use std::str::FromStr;

    let fields = expr.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };
    cron::Schedule::from_str(&normalized)
        .map_err(|e| QueueError::Execution(format!("invalid cron expression '{expr}': {e}")))
}
