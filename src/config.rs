//! Process configuration from the environment.
//!
//! Every setting has a default; only the variables listed on [`AppConfig`]
//! are read. Per-connector webhook secrets are not configuration: they are
//! looked up at request time through a [`SecretStore`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::batch::BatchConfig;
use crate::jobqueue::{QueueConfig, StoreError};
use crate::retry::RetryConfig;
use crate::types::ConnectorId;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },

    #[error("{0} is required")]
    Missing(&'static str),
}

/// Reads and parses `key`. Unset or empty means `None`.
pub(crate) fn env_parse<T: FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => {
            value
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| ConfigError::Invalid { key, value })
        }
        _ => Ok(None),
    }
}

fn env_string(key: &'static str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Everything the binary needs to start.
///
/// | Variable | Default |
/// |---|---|
/// | `REVIEW_RELAY_BIND` | `0.0.0.0:8888` |
/// | `REVIEW_RELAY_DB` | `review-relay.db` |
/// | `REVIEW_RELAY_CAPTURE_DIR` | unset (capture off) |
/// | `REVIEW_RELAY_PUBLIC_URL` | unset |
/// | `REVIEW_RELAY_WEBHOOK_SECRET` | unset |
/// | `REVIEW_RELAY_SECRET_CACHE_TTL_SECS` | `300` |
/// | `REVIEW_RELAY_MAX_WORKERS` | CPU count |
/// | `REVIEW_RELAY_MAX_BATCH_TOKENS` | `10000` |
/// | `REVIEW_RELAY_QUEUE_WORKERS` | `10` |
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind: SocketAddr,
    pub database_path: PathBuf,
    pub capture_dir: Option<PathBuf>,
    /// Fallback secret for connectors without their own.
    pub webhook_secret: Option<String>,
    pub secret_cache_ttl: Duration,
    pub batch: BatchConfig,
    pub retry: RetryConfig,
    pub queue: QueueConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            bind: SocketAddr::from(([0, 0, 0, 0], 8888)),
            database_path: PathBuf::from("review-relay.db"),
            capture_dir: None,
            webhook_secret: None,
            secret_cache_ttl: Duration::from_secs(300),
            batch: BatchConfig::default(),
            retry: RetryConfig::LLM,
            queue: QueueConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = AppConfig::default();
        let queue = QueueConfig::from_env()?;
        Ok(AppConfig {
            bind: env_parse("REVIEW_RELAY_BIND")?.unwrap_or(defaults.bind),
            database_path: env_string("REVIEW_RELAY_DB")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            capture_dir: env_string("REVIEW_RELAY_CAPTURE_DIR").map(PathBuf::from),
            webhook_secret: queue.webhook_secret.clone(),
            secret_cache_ttl: env_parse("REVIEW_RELAY_SECRET_CACHE_TTL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.secret_cache_ttl),
            batch: BatchConfig::from_env()?,
            retry: defaults.retry,
            queue,
        })
    }
}

/// Resolves the webhook secret configured for a connector.
///
/// Implementations may block briefly; async callers should go through
/// `spawn_blocking`.
pub trait SecretStore: Send + Sync {
    fn webhook_secret(
        &self,
        connector_id: &ConnectorId,
        provider: &str,
    ) -> Result<Option<String>, StoreError>;

    /// Cheap reachability check for `GET /health`.
    fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Fixed secrets, keyed by connector, for tests and single-tenant setups.
#[derive(Debug, Clone, Default)]
pub struct StaticSecrets {
    by_connector: HashMap<ConnectorId, String>,
}

impl StaticSecrets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, connector_id: impl Into<ConnectorId>, secret: impl Into<String>) -> Self {
        self.by_connector.insert(connector_id.into(), secret.into());
        self
    }
}

impl SecretStore for StaticSecrets {
    fn webhook_secret(
        &self,
        connector_id: &ConnectorId,
        _provider: &str,
    ) -> Result<Option<String>, StoreError> {
        Ok(self.by_connector.get(connector_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.bind.port(), 8888);
        assert_eq!(config.database_path, PathBuf::from("review-relay.db"));
        assert!(config.capture_dir.is_none());
        assert_eq!(config.batch.max_batch_tokens, 10_000);
        assert_eq!(config.retry, RetryConfig::LLM);
    }

    #[test]
    fn unset_variable_parses_to_none() {
        let parsed: Option<u16> = env_parse("REVIEW_RELAY_TEST_SURELY_UNSET").unwrap();
        assert_eq!(parsed, None);
    }

    #[test]
    fn static_secrets_lookup() {
        let secrets = StaticSecrets::new().with("conn-1", "s3cret");
        assert_eq!(
            secrets
                .webhook_secret(&ConnectorId::new("conn-1"), "github")
                .unwrap()
                .as_deref(),
            Some("s3cret")
        );
        assert_eq!(
            secrets
                .webhook_secret(&ConnectorId::new("other"), "github")
                .unwrap(),
            None
        );
    }
}
