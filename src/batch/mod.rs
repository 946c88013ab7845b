//! Token-budgeted batching of diff sets and the worker pool that processes
//! the batches.

mod batcher;
mod binary;
mod pool;
mod tokens;

pub use batcher::{BatchAssessment, BatchInput, Batcher, CodeDiff, DiffHunk};
pub use binary::{has_binary_extension, looks_binary};
pub use pool::{BatchOutcome, run_batches};
pub use tokens::{SimpleTokenCounter, TokenCounter};

use std::time::Duration;

use crate::config::{ConfigError, env_parse};

/// Batching and worker pool settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    /// Upper bound on concurrently processed batches.
    pub max_workers: usize,
    /// Retries per batch after the first attempt.
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub max_batch_tokens: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            max_workers: std::thread::available_parallelism().map_or(1, |n| n.get()),
            max_retries: 3,
            retry_delay: Duration::from_secs(2),
            max_batch_tokens: 10_000,
        }
    }
}

impl BatchConfig {
    /// Defaults overridden by `REVIEW_RELAY_MAX_WORKERS` and
    /// `REVIEW_RELAY_MAX_BATCH_TOKENS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = BatchConfig::default();
        if let Some(n) = env_parse("REVIEW_RELAY_MAX_WORKERS")? {
            config.max_workers = n;
        }
        if let Some(n) = env_parse("REVIEW_RELAY_MAX_BATCH_TOKENS")? {
            config.max_batch_tokens = n;
        }
        Ok(config)
    }

    pub fn batcher(&self) -> Batcher {
        Batcher::new(self.max_batch_tokens)
    }
}
