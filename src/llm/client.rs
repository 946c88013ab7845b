//! Model client wrapper adding retry, timeouts, JSON self-repair and event
//! reporting.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::events::{BatchStats, EventSink, RequestScope, TracingEventSink};
use super::processor::{ProcessError, process_llm_response};
use super::repair::RepairStats;
use crate::retry::{RetryConfig, RetryError, RetryNotice, RetryScope, retry_with_backoff};
use crate::types::BatchId;

const OPERATION: &str = "llm_generate_response";

/// A remote language model.
pub trait LlmClient: Send + Sync {
    /// The error type returned by this client.
    type Error: fmt::Display + Send;

    fn generate_response(
        &self,
        prompt: &str,
    ) -> impl Future<Output = Result<String, Self::Error>> + Send;
}

/// One prompt plus the bounds it runs under.
#[derive(Debug, Clone, Default)]
pub struct ResilientRequest {
    pub scope: RequestScope,
    pub prompt: String,
    /// Bounds every attempt and backoff wait together.
    pub timeout: Option<Duration>,
    /// Bounds each attempt on its own.
    pub attempt_timeout: Option<Duration>,
}

impl ResilientRequest {
    pub fn new(scope: RequestScope, prompt: impl Into<String>) -> Self {
        ResilientRequest {
            scope,
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }
}

/// Result of a resilient call. Never an `Err`: failures are described by
/// `success` and `error`.
#[derive(Debug, Clone)]
pub struct ResilientResponse<T = serde_json::Value> {
    /// The JSON the value was parsed from, after any repair.
    pub response: String,
    pub value: Option<T>,
    pub success: bool,
    pub attempts_made: u32,
    pub total_duration: Duration,
    pub json_repaired: bool,
    pub repair_stats: Option<RepairStats>,
    pub retry_reasons: Vec<String>,
    pub error: Option<String>,
}

/// Why one attempt failed.
#[derive(Debug)]
enum DispatchFailure<E> {
    Client(E),
    Processing(ProcessError),
}

impl<E: fmt::Display> fmt::Display for DispatchFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchFailure::Client(e) => write!(f, "{e}"),
            DispatchFailure::Processing(_) => write!(f, "json_processing_failed"),
        }
    }
}

pub struct ResilientClient<C> {
    client: C,
    retry: RetryConfig,
    sink: Arc<dyn EventSink>,
}

impl<C: LlmClient> ResilientClient<C> {
    pub fn new(client: C, retry: RetryConfig, sink: Arc<dyn EventSink>) -> Self {
        ResilientClient {
            client,
            retry,
            sink,
        }
    }

    /// Uses [`RetryConfig::LLM`] and logs events through `tracing`.
    pub fn with_defaults(client: C) -> Self {
        Self::new(client, RetryConfig::LLM, Arc::new(TracingEventSink))
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    pub fn sink(&self) -> &Arc<dyn EventSink> {
        &self.sink
    }

    /// Generates and parses a response as untyped JSON.
    pub async fn generate(
        &self,
        request: &ResilientRequest,
        cancel: &CancellationToken,
    ) -> ResilientResponse {
        self.generate_as(request, cancel).await
    }

    /// Generates a response and parses it into `T`, retrying both transport
    /// failures and responses that cannot be repaired into a `T`.
    pub async fn generate_as<T>(
        &self,
        request: &ResilientRequest,
        cancel: &CancellationToken,
    ) -> ResilientResponse<T>
    where
        T: DeserializeOwned + Send,
    {
        let sink = &self.sink;
        let scope = &request.scope;
        let observer = |notice: &RetryNotice| {
            if notice.timed_out {
                sink.timeout(
                    scope,
                    OPERATION,
                    request.attempt_timeout,
                    request.attempt_timeout.unwrap_or_default(),
                );
            }
            sink.retry(scope, notice.attempt, &notice.reason, notice.delay);
        };

        let mut retry_scope = RetryScope::new().cancel_on(cancel).observe(&observer);
        if let Some(timeout) = request.timeout {
            retry_scope = retry_scope.deadline(Instant::now() + timeout);
        }
        if let Some(timeout) = request.attempt_timeout {
            retry_scope = retry_scope.attempt_timeout(timeout);
        }

        let client = &self.client;
        let prompt = request.prompt.as_str();
        let result = retry_with_backoff(&self.retry, retry_scope, move |attempt| async move {
            debug!(attempt, review_id = scope.review_id, "Sending model request");
            let raw = match client.generate_response(prompt).await {
                Ok(raw) => raw,
                Err(e) => return Err(DispatchFailure::Client(e)),
            };
            process_llm_response::<T>(&raw).map_err(|e| {
                warn!(attempt, error = %e, "Model response processing failed");
                DispatchFailure::Processing(e)
            })
        })
        .await;

        let mut response = ResilientResponse {
            response: String::new(),
            value: None,
            success: false,
            attempts_made: result.attempts,
            total_duration: result.total_duration,
            json_repaired: false,
            repair_stats: None,
            retry_reasons: result.retry_reasons,
            error: None,
        };

        match result.outcome {
            Ok(processed) => {
                if processed.stats.was_repaired {
                    self.sink.json_repair(scope, &processed.stats);
                }
                response.success = true;
                response.json_repaired = processed.stats.was_repaired;
                response.repair_stats = Some(processed.stats);
                response.response = processed.repaired_json;
                response.value = Some(processed.value);
            }
            Err(error) => {
                if matches!(error, RetryError::DeadlineExceeded) {
                    self.sink
                        .timeout(scope, OPERATION, request.timeout, response.total_duration);
                }
                response.error = Some(error.to_string());
            }
        }
        response
    }
}

/// Dispatches a group of requests under one batch id and reports totals.
pub struct BatchDispatcher<C> {
    client: Arc<ResilientClient<C>>,
}

impl<C: LlmClient> BatchDispatcher<C> {
    pub fn new(client: Arc<ResilientClient<C>>) -> Self {
        BatchDispatcher { client }
    }

    /// Sends each request in turn, tagging it with `batch_id`.
    pub async fn process_batch(
        &self,
        requests: Vec<ResilientRequest>,
        batch_id: BatchId,
        cancel: &CancellationToken,
    ) -> (Vec<ResilientResponse>, BatchStats) {
        let start = Instant::now();
        let mut stats = BatchStats {
            total_requests: requests.len(),
            ..Default::default()
        };
        let mut responses = Vec::with_capacity(requests.len());
        let mut batch_scope = None;

        for mut request in requests {
            request.scope.batch_id = Some(batch_id);
            batch_scope.get_or_insert_with(|| request.scope.clone());

            let response = self.client.generate(&request, cancel).await;
            if response.success {
                stats.successful += 1;
            }
            stats.retries += response.attempts_made.saturating_sub(1);
            if response.json_repaired {
                stats.json_repairs += 1;
            }
            responses.push(response);
        }

        if stats.total_requests > 0 {
            stats.avg_response_time = start.elapsed() / stats.total_requests as u32;
        }
        if let Some(scope) = batch_scope {
            self.client.sink.batch_stats(&scope, &stats);
        }
        (responses, stats)
    }
}
