//! Structured sink for dispatch decisions: retries, repairs, timeouts and
//! per-batch statistics.

use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use super::repair::RepairStats;
use crate::types::BatchId;

/// Which review run a dispatch event belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RequestScope {
    pub review_id: i64,
    pub org_id: i64,
    pub batch_id: Option<BatchId>,
}

impl RequestScope {
    pub fn new(review_id: i64, org_id: i64) -> Self {
        RequestScope {
            review_id,
            org_id,
            batch_id: None,
        }
    }

    pub fn with_batch(mut self, batch_id: BatchId) -> Self {
        self.batch_id = Some(batch_id);
        self
    }
}

/// Aggregate numbers for one dispatched batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchStats {
    pub total_requests: usize,
    pub successful: usize,
    /// Attempts beyond the first, summed over requests.
    pub retries: u32,
    pub json_repairs: usize,
    pub avg_response_time: Duration,
}

pub trait EventSink: Send + Sync {
    /// A failed attempt that will be retried after `delay`.
    fn retry(&self, scope: &RequestScope, attempt: u32, reason: &str, delay: Duration);

    fn json_repair(&self, scope: &RequestScope, stats: &RepairStats);

    /// `configured` is the limit that fired, if one was set.
    fn timeout(
        &self,
        scope: &RequestScope,
        operation: &str,
        configured: Option<Duration>,
        actual: Duration,
    );

    fn batch_stats(&self, scope: &RequestScope, stats: &BatchStats);
}

/// Emits every event as a `tracing` record.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn retry(&self, scope: &RequestScope, attempt: u32, reason: &str, delay: Duration) {
        warn!(
            review_id = scope.review_id,
            org_id = scope.org_id,
            batch_id = scope.batch_id.map(|b| b.0),
            attempt,
            delay_ms = delay.as_millis() as u64,
            reason,
            "Model request retry"
        );
    }

    fn json_repair(&self, scope: &RequestScope, stats: &RepairStats) {
        info!(
            review_id = scope.review_id,
            org_id = scope.org_id,
            batch_id = scope.batch_id.map(|b| b.0),
            original_bytes = stats.original_bytes,
            repaired_bytes = stats.repaired_bytes,
            fields_recovered = stats.fields_recovered,
            comments_lost = stats.comments_lost,
            strategies = %stats.strategies.join(","),
            repair_ms = stats.repair_time.as_millis() as u64,
            "Model response JSON repaired"
        );
    }

    fn timeout(
        &self,
        scope: &RequestScope,
        operation: &str,
        configured: Option<Duration>,
        actual: Duration,
    ) {
        warn!(
            review_id = scope.review_id,
            org_id = scope.org_id,
            batch_id = scope.batch_id.map(|b| b.0),
            operation,
            configured_ms = configured.map(|d| d.as_millis() as u64),
            actual_ms = actual.as_millis() as u64,
            "Model request timed out"
        );
    }

    fn batch_stats(&self, scope: &RequestScope, stats: &BatchStats) {
        info!(
            review_id = scope.review_id,
            org_id = scope.org_id,
            batch_id = scope.batch_id.map(|b| b.0),
            total = stats.total_requests,
            successful = stats.successful,
            retries = stats.retries,
            json_repairs = stats.json_repairs,
            avg_response_ms = stats.avg_response_time.as_millis() as u64,
            "Batch dispatch complete"
        );
    }
}

/// One event captured by [`RecordingEventSink`].
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Retry {
        scope: RequestScope,
        attempt: u32,
        reason: String,
        delay: Duration,
    },
    JsonRepair {
        scope: RequestScope,
        strategies: Vec<&'static str>,
    },
    Timeout {
        scope: RequestScope,
        operation: String,
        configured: Option<Duration>,
    },
    BatchStats {
        scope: RequestScope,
        stats: BatchStats,
    },
}

/// Keeps events in memory for assertions.
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<SinkEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.events
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    fn push(&self, event: SinkEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl EventSink for RecordingEventSink {
    fn retry(&self, scope: &RequestScope, attempt: u32, reason: &str, delay: Duration) {
        self.push(SinkEvent::Retry {
            scope: scope.clone(),
            attempt,
            reason: reason.to_string(),
            delay,
        });
    }

    fn json_repair(&self, scope: &RequestScope, stats: &RepairStats) {
        self.push(SinkEvent::JsonRepair {
            scope: scope.clone(),
            strategies: stats.strategies.clone(),
        });
    }

    fn timeout(
        &self,
        scope: &RequestScope,
        operation: &str,
        configured: Option<Duration>,
        _actual: Duration,
    ) {
        self.push(SinkEvent::Timeout {
            scope: scope.clone(),
            operation: operation.to_string(),
            configured,
        });
    }

    fn batch_stats(&self, scope: &RequestScope, stats: &BatchStats) {
        self.push(SinkEvent::BatchStats {
            scope: scope.clone(),
            stats: stats.clone(),
        });
    }
}
