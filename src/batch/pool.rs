//! Fixed-size worker pool for batch processing.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::BatchConfig;
use crate::retry::{RetryConfig, RetryScope, retry_with_backoff};
use crate::types::BatchId;

/// What happened to one batch.
#[derive(Debug)]
pub struct BatchOutcome<R> {
    pub id: BatchId,
    pub attempts: u32,
    pub duration: Duration,
    /// The processor's output, or the final failure rendered as text.
    pub result: Result<R, String>,
}

type Queue<T> = Arc<Mutex<VecDeque<(usize, T)>>>;

fn next_job<T>(queue: &Queue<T>) -> Option<(usize, T)> {
    queue.lock().ok().and_then(|mut q| q.pop_front())
}

/// Runs `processor` over every batch with at most `config.max_workers`
/// batches in flight.
///
/// Each batch is retried up to `config.max_retries` times, `retry_delay`
/// apart. Outcomes come back in batch order whatever order they finished
/// in. Cancelling `cancel` fails the remaining batches promptly.
pub async fn run_batches<T, R, E, F, Fut>(
    batches: Vec<T>,
    processor: F,
    config: &BatchConfig,
    cancel: &CancellationToken,
) -> Vec<BatchOutcome<R>>
where
    T: Clone + Send + 'static,
    R: Send + 'static,
    E: fmt::Display + Send + 'static,
    F: Fn(BatchId, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
{
    let total = batches.len();
    if total == 0 {
        return Vec::new();
    }

    let workers = config.max_workers.max(1).min(total);
    info!(batches = total, workers, "Starting batch worker pool");

    let queue: Queue<T> = Arc::new(Mutex::new(batches.into_iter().enumerate().collect()));
    let processor = Arc::new(processor);
    let retry = RetryConfig::fixed(config.max_retries, config.retry_delay);

    let mut set = JoinSet::new();
    for worker in 0..workers {
        let queue = queue.clone();
        let processor = processor.clone();
        let cancel = cancel.clone();
        set.spawn(async move {
            let mut done = Vec::new();
            while let Some((index, batch)) = next_job(&queue) {
                let id = BatchId::from_index(index);
                debug!(worker, batch_id = %id, "Processing batch");
                let process = processor.clone();
                let result = retry_with_backoff(
                    &retry,
                    RetryScope::new().cancel_on(&cancel),
                    move |_| process(id, batch.clone()),
                )
                .await;

                let outcome = BatchOutcome {
                    id,
                    attempts: result.attempts,
                    duration: result.total_duration,
                    result: result.outcome.map_err(|e| e.to_string()),
                };
                match &outcome.result {
                    Ok(_) => info!(batch_id = %id, attempts = outcome.attempts, "Batch completed"),
                    Err(e) => warn!(batch_id = %id, attempts = outcome.attempts, error = %e, "Batch failed"),
                }
                done.push((index, outcome));
            }
            done
        });
    }

    let mut slots: Vec<Option<BatchOutcome<R>>> = (0..total).map(|_| None).collect();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(done) => {
                for (index, outcome) in done {
                    slots[index] = Some(outcome);
                }
            }
            Err(e) => error!(error = %e, "Batch worker panicked"),
        }
    }

    slots
        .into_iter()
        .enumerate()
        .map(|(index, slot)| {
            slot.unwrap_or_else(|| BatchOutcome {
                id: BatchId::from_index(index),
                attempts: 0,
                duration: Duration::ZERO,
                result: Err("batch worker terminated before completion".to_string()),
            })
        })
        .collect()
}
