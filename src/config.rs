//! Environment-driven configuration.
//!
//! All recognized options live here; `Config::from_env` reads the process
//! environment (after `dotenvy` has loaded any `.env` file) and validates
//! the combination once at startup.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

/// A configuration problem found at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Fully parsed configuration for one process.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL. Required.
    pub database_url: String,
    /// Bypass auth for local/dev; auto-mints the "dev" user.
    pub auth_disabled: bool,
    /// Enforce a single owner at startup.
    pub single_tenant: bool,
    /// Permitted OAuth principal for SINGLE_TENANT installs.
    pub owner_email: Option<String>,
    /// Shared HMAC secret for session tokens.
    pub jwt_secret: Option<SecretString>,
    /// Shared secret gating /internal endpoints.
    pub internal_api_secret: Option<SecretString>,
    /// Users with these emails get the ADMIN role.
    pub admin_emails: Vec<String>,
    /// Enable per-token SSE streaming.
    pub llm_token_stream: bool,
    /// Chat-completions binding: base URL, key, default model.
    pub llm_base_url: String,
    pub llm_api_key: Option<SecretString>,
    pub llm_model: String,
    /// Source for remote job manifests.
    pub jobs_git_repo_url: Option<String>,
    pub jobs_git_branch: Option<String>,
    pub jobs_git_token: Option<SecretString>,
    pub jobs_dir: Option<PathBuf>,
    /// Hours before missing ingest heartbeats raise a health alert.
    pub ingest_stale_threshold_hours: u64,
    /// Filesystem root for commis artifacts.
    pub worker_data_path: Option<PathBuf>,
    /// HTTP bind address for the gateway.
    pub bind_addr: SocketAddr,
    /// Queue worker lease duration.
    pub queue_lease: Duration,
    /// Number of queue worker tasks.
    pub queue_workers: usize,
    /// Scheduler backfill window for missed cron fires.
    pub backfill_window: Duration,
    /// Default concierge turn timeout.
    pub concierge_timeout: Duration,
    /// Use the ephemeral in-memory datastore (dev only; state dies with
    /// the process).
    pub memory_db: bool,
}

impl Config {
    /// Read configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("DATABASE_URL").ok();
        let memory_db = env_bool("MEMORY_DB", false);
        let database_url = match (database_url, memory_db) {
            (Some(url), _) => url,
            (None, true) => String::new(),
            (None, false) => return Err(ConfigError::Missing("DATABASE_URL")),
        };

        let config = Self {
            database_url,
            auth_disabled: env_bool("AUTH_DISABLED", false),
            single_tenant: env_bool("SINGLE_TENANT", false),
            owner_email: env_opt("OWNER_EMAIL"),
            jwt_secret: env_opt("JWT_SECRET").map(SecretString::from),
            internal_api_secret: env_opt("INTERNAL_API_SECRET").map(SecretString::from),
            admin_emails: env_opt("ADMIN_EMAILS")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_ascii_lowercase())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            llm_token_stream: env_bool("LLM_TOKEN_STREAM", false),
            llm_base_url: env_opt("LLM_BASE_URL")
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            llm_api_key: env_opt("LLM_API_KEY").map(SecretString::from),
            llm_model: env_opt("LLM_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
            jobs_git_repo_url: env_opt("JOBS_GIT_REPO_URL"),
            jobs_git_branch: env_opt("JOBS_GIT_BRANCH"),
            jobs_git_token: env_opt("JOBS_GIT_TOKEN").map(SecretString::from),
            jobs_dir: env_opt("JOBS_DIR").map(PathBuf::from),
            ingest_stale_threshold_hours: env_parse("INGEST_STALE_THRESHOLD_HOURS", 4)?,
            worker_data_path: env_opt("WORKER_DATA_PATH").map(PathBuf::from),
            bind_addr: env_opt("BIND_ADDR")
                .map(|v| {
                    v.parse().map_err(|e| ConfigError::Invalid {
                        name: "BIND_ADDR",
                        reason: format!("{e}"),
                    })
                })
                .transpose()?
                .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8001))),
            queue_lease: Duration::from_secs(env_parse("QUEUE_LEASE_SECS", 60)?),
            queue_workers: env_parse("QUEUE_WORKERS", 2)?,
            backfill_window: Duration::from_secs(env_parse("BACKFILL_WINDOW_SECS", 6 * 60 * 60)?),
            concierge_timeout: Duration::from_secs(env_parse("CONCIERGE_TIMEOUT_SECS", 120)?),
            memory_db,
        };

        config.validate()?;
        Ok(config)
    }

    /// Cross-field validation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.single_tenant && self.owner_email.is_none() {
            return Err(ConfigError::Invalid {
                name: "OWNER_EMAIL",
                reason: "required when SINGLE_TENANT=true".to_string(),
            });
        }
        if !self.auth_disabled && self.jwt_secret.is_none() {
            return Err(ConfigError::Invalid {
                name: "JWT_SECRET",
                reason: "required unless AUTH_DISABLED=true".to_string(),
            });
        }
        Ok(())
    }

    /// A config suitable for tests: memory datastore, auth disabled.
    pub fn for_tests() -> Self {
        Self {
            database_url: String::new(),
            auth_disabled: true,
            single_tenant: false,
            owner_email: None,
            jwt_secret: None,
            internal_api_secret: Some(SecretString::from("internal-test-secret")),
            admin_emails: Vec::new(),
            llm_token_stream: false,
            llm_base_url: "https://api.openai.com/v1".to_string(),
            llm_api_key: None,
            llm_model: "scripted".to_string(),
            jobs_git_repo_url: None,
            jobs_git_branch: None,
            jobs_git_token: None,
            jobs_dir: None,
            ingest_stale_threshold_hours: 4,
            worker_data_path: None,
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            queue_lease: Duration::from_secs(60),
            queue_workers: 2,
            backfill_window: Duration::from_secs(6 * 60 * 60),
            concierge_timeout: Duration::from_secs(120),
            memory_db: true,
        }
    }
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_parse<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env_opt(name) {
        Some(v) => v.parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_has_sane_defaults() {
        let config = Config::for_tests();
        assert!(config.auth_disabled);
        assert!(config.memory_db);
        assert_eq!(config.ingest_stale_threshold_hours, 4);
        config.validate().unwrap();
    }

    #[test]
    fn single_tenant_requires_owner_email() {
        let mut config = Config::for_tests();
        config.single_tenant = true;
        assert!(config.validate().is_err());

        config.owner_email = Some("owner@example.com".to_string());
        config.validate().unwrap();
    }

    #[test]
    fn auth_enabled_requires_jwt_secret() {
        let mut config = Config::for_tests();
        config.auth_disabled = false;
        assert!(config.validate().is_err());

        config.jwt_secret = Some(SecretString::from("s3cret"));
        config.validate().unwrap();
    }
}
