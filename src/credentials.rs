//! Credential resolution for tool calls.
//!
//! The vault itself is an external collaborator; in-process code only sees
//! this resolver trait. Resolvers are carried on the execution context and
//! never cross task boundaries implicitly; code running on another task
//! must be handed the resolver explicitly.

use std::collections::HashMap;

use async_trait::async_trait;
use secrecy::SecretString;

#[async_trait]
pub trait CredentialResolver: Send + Sync {
    /// Look up a secret for `(owner_id, key)`. None means the owner has no
    /// credential under that key.
    async fn resolve(&self, owner_id: i64, key: &str) -> Option<SecretString>;
}

/// Resolves secrets from process environment variables, uppercasing the
/// key (`github_token` -> `GITHUB_TOKEN`). Owner-agnostic; meant for
/// single-tenant and dev installs.
pub struct EnvCredentialResolver;

#[async_trait]
impl CredentialResolver for EnvCredentialResolver {
    async fn resolve(&self, _owner_id: i64, key: &str) -> Option<SecretString> {
        let name = key.to_ascii_uppercase().replace('-', "_");
        std::env::var(name).ok().map(SecretString::from)
    }
}

/// Fixed credential set for tests.
#[derive(Default)]
pub struct StaticCredentials {
    secrets: HashMap<(i64, String), SecretString>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, owner_id: i64, key: &str, value: &str) -> Self {
        self.secrets
            .insert((owner_id, key.to_string()), SecretString::from(value));
        self
    }
}

#[async_trait]
impl CredentialResolver for StaticCredentials {
    async fn resolve(&self, owner_id: i64, key: &str) -> Option<SecretString> {
        self.secrets.get(&(owner_id, key.to_string())).cloned()
    }
}

#[cfg(test)]
mod tests {
    use secrecy::ExposeSecret;

    use super::*;

    #[tokio::test]
    async fn static_credentials_scope_by_owner() {
        let creds = StaticCredentials::new().with(1, "api_key", "s3cret");
        assert_eq!(
            creds.resolve(1, "api_key").await.unwrap().expose_secret(),
            "s3cret"
        );
        assert!(creds.resolve(2, "api_key").await.is_none());
        assert!(creds.resolve(1, "other").await.is_none());
    }
}
