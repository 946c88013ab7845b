//! Job queue tuning.

use std::time::Duration;

use crate::config::{ConfigError, env_parse};
use crate::retry::RetryConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Jobs executed concurrently.
    pub max_workers: usize,
    /// Rescheduling policy for failed jobs. `max_retries` bounds how often a
    /// job is re-run before it is discarded.
    pub retry_policy: RetryConfig,
    pub job_timeout: Duration,
    /// How long an idle runner waits before polling again.
    pub poll_interval: Duration,
    /// Base URL the forges use to reach this service.
    pub public_endpoint: String,
    /// Secret installed into every webhook this service creates.
    pub webhook_secret: Option<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            max_workers: 10,
            retry_policy: RetryConfig::QUEUE,
            job_timeout: Duration::from_secs(5 * 60),
            poll_interval: Duration::from_secs(1),
            public_endpoint: String::new(),
            webhook_secret: None,
        }
    }
}

impl QueueConfig {
    /// Defaults overridden by `REVIEW_RELAY_QUEUE_WORKERS`,
    /// `REVIEW_RELAY_PUBLIC_URL` and `REVIEW_RELAY_WEBHOOK_SECRET`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = QueueConfig::default();
        if let Some(n) = env_parse("REVIEW_RELAY_QUEUE_WORKERS")? {
            config.max_workers = n;
        }
        if let Some(url) = env_parse::<String>("REVIEW_RELAY_PUBLIC_URL")? {
            config.public_endpoint = url.trim_end_matches('/').to_string();
        }
        config.webhook_secret = env_parse("REVIEW_RELAY_WEBHOOK_SECRET")?;
        Ok(config)
    }

    pub fn max_attempts(&self) -> u32 {
        self.retry_policy.max_attempts()
    }

    /// Delay before re-running a job whose `attempt`th run (1-based) failed.
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        self.retry_policy
            .delay_for_attempt(attempt.saturating_sub(1))
    }
}
