//! Exponential backoff retry with cancellation, deadlines and per-attempt
//! timeouts.
//!
//! - Default: 3 retries, 1s base, 30s cap, x2 (general remote calls)
//! - LLM: 3 retries, 2s base, 60s cap, x2.5 (slow model endpoints)
//! - Queue: 25 retries, 1s base, 1h cap, x2 (background jobs)
//!
//! Every failure within the budget is retried. [`is_retryable`] only
//! classifies failures for logs and event sinks.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

mod classify;

pub use classify::is_retryable;

/// Share of the computed delay used as symmetric jitter.
const JITTER_FRACTION: f64 = 0.1;

/// Configuration for exponential backoff retry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    /// Retries after the initial attempt.
    pub max_retries: u32,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Cap for exponential growth.
    pub max_delay: Duration,

    pub backoff_multiplier: f64,

    /// Adds up to ±10% random jitter to each delay.
    pub jitter: bool,

    /// Logs each failed attempt at `warn`.
    pub log_retries: bool,
}

impl RetryConfig {
    /// General-purpose remote calls.
    ///
    /// - 3 retries with 1s, 2s, 4s delays (before jitter)
    pub const DEFAULT: Self = Self {
        max_retries: 3,
        initial_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(30),
        backoff_multiplier: 2.0,
        jitter: true,
        log_retries: true,
    };

    /// Model endpoints, which are slow and rate limited.
    ///
    /// - 3 retries with 2s, 5s, 12.5s delays (before jitter)
    pub const LLM: Self = Self {
        max_retries: 3,
        initial_delay: Duration::from_secs(2),
        max_delay: Duration::from_secs(60),
        backoff_multiplier: 2.5,
        jitter: true,
        log_retries: true,
    };

    /// Background jobs: retried over hours, rescheduled rather than slept.
    pub const QUEUE: Self = Self {
        max_retries: 25,
        initial_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(60 * 60),
        backoff_multiplier: 2.0,
        jitter: false,
        log_retries: false,
    };

    pub fn new(
        max_retries: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
            backoff_multiplier,
            jitter: false,
            log_retries: true,
        }
    }

    /// The same delay before every retry.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self::new(max_retries, delay, delay, 1.0)
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_logging(mut self, log_retries: bool) -> Self {
        self.log_retries = log_retries;
        self
    }

    /// Delay before retry `attempt` (0-indexed), without jitter:
    /// `initial_delay * backoff_multiplier^attempt`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = self.backoff_multiplier.powi(attempt as i32);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        let capped_secs = delay_secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped_secs)
    }

    /// Applies jitter to [`delay_for_attempt`](Self::delay_for_attempt).
    ///
    /// `unit` in `[-1, 1]` selects the point in the jitter range. A
    /// non-positive result falls back to `initial_delay`.
    pub fn jittered_delay(&self, attempt: u32, unit: f64) -> Duration {
        let base = self.delay_for_attempt(attempt).as_secs_f64();
        let jittered = base + base * JITTER_FRACTION * unit.clamp(-1.0, 1.0);
        if jittered <= 0.0 {
            self.initial_delay
        } else {
            Duration::from_secs_f64(jittered)
        }
    }

    /// Delay actually waited before retry `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if self.jitter {
            let unit = rand::rng().random_range(-1.0..=1.0);
            self.jittered_delay(attempt, unit)
        } else {
            self.delay_for_attempt(attempt)
        }
    }

    /// All retry delays, without jitter.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_retries).map(|attempt| self.delay_for_attempt(attempt))
    }

    pub fn total_max_wait(&self) -> Duration {
        self.delays().sum()
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Why a single attempt failed.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptError<E> {
    Failed(E),
    TimedOut(Duration),
}

impl<E: fmt::Display> fmt::Display for AttemptError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptError::Failed(e) => write!(f, "{e}"),
            AttemptError::TimedOut(after) => write!(f, "attempt timed out after {after:?}"),
        }
    }
}

/// Terminal failure of a retried operation.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryError<E> {
    /// Every attempt failed; carries the last failure.
    Exhausted(AttemptError<E>),
    /// The cancellation token fired.
    Cancelled,
    /// The overall deadline passed.
    DeadlineExceeded,
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Exhausted(e) => write!(f, "{e}"),
            RetryError::Cancelled => write!(f, "operation cancelled"),
            RetryError::DeadlineExceeded => write!(f, "deadline exceeded"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryError<E> {}

/// Outcome of [`retry_with_backoff`] plus what it took to get there.
#[derive(Debug)]
pub struct RetryResult<T, E> {
    pub outcome: Result<T, RetryError<E>>,
    /// Attempts started, including the initial one.
    pub attempts: u32,
    pub total_duration: Duration,
    /// One entry per failed attempt.
    pub retry_reasons: Vec<String>,
}

impl<T, E> RetryResult<T, E> {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn last_error(&self) -> Option<&RetryError<E>> {
        self.outcome.as_ref().err()
    }

    pub fn into_result(self) -> Result<T, RetryError<E>> {
        self.outcome
    }
}

/// Reported to the observer after a failed attempt that will be retried.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryNotice {
    /// 1-based number of the attempt that failed.
    pub attempt: u32,
    pub max_attempts: u32,
    pub delay: Duration,
    pub reason: String,
    pub retryable: bool,
    pub timed_out: bool,
}

/// Bounds and hooks around a retried operation.
#[derive(Clone, Copy, Default)]
pub struct RetryScope<'a> {
    cancel: Option<&'a CancellationToken>,
    attempt_timeout: Option<Duration>,
    deadline: Option<Instant>,
    observer: Option<&'a (dyn Fn(&RetryNotice) + Send + Sync)>,
}

impl<'a> RetryScope<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stops immediately, mid-attempt or mid-wait, when `token` fires.
    pub fn cancel_on(mut self, token: &'a CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Bounds each attempt; a timeout is a retryable failure.
    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Bounds all attempts and waits together; expiry is terminal.
    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn observe(mut self, observer: &'a (dyn Fn(&RetryNotice) + Send + Sync)) -> Self {
        self.observer = Some(observer);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_some_and(CancellationToken::is_cancelled)
    }

    fn is_past_deadline(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

enum Interrupt<E> {
    Attempt(AttemptError<E>),
    Cancelled,
    DeadlineExceeded,
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

async fn deadline_reached(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn run_attempt<T, E, Fut>(scope: &RetryScope<'_>, fut: Fut) -> Result<T, Interrupt<E>>
where
    Fut: Future<Output = Result<T, E>>,
{
    let attempt = async {
        match scope.attempt_timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result.map_err(AttemptError::Failed),
                Err(_) => Err(AttemptError::TimedOut(limit)),
            },
            None => fut.await.map_err(AttemptError::Failed),
        }
    };

    tokio::select! {
        biased;
        () = cancelled(scope.cancel) => Err(Interrupt::Cancelled),
        () = deadline_reached(scope.deadline) => Err(Interrupt::DeadlineExceeded),
        result = attempt => result.map_err(Interrupt::Attempt),
    }
}

/// Runs `operation` until it succeeds or the budget in `config` is spent.
///
/// Attempts are strictly sequential. Cancellation and deadline expiry end
/// the loop at once, whether an attempt or a backoff wait is in progress.
pub async fn retry_with_backoff<T, E, F, Fut>(
    config: &RetryConfig,
    scope: RetryScope<'_>,
    mut operation: F,
) -> RetryResult<T, E>
where
    E: fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let start = Instant::now();
    let max_attempts = config.max_attempts();
    let mut attempts = 0u32;
    let mut retry_reasons = Vec::new();

    let finish = |outcome, attempts, retry_reasons| RetryResult {
        outcome,
        attempts,
        total_duration: start.elapsed(),
        retry_reasons,
    };

    loop {
        if scope.is_cancelled() {
            return finish(Err(RetryError::Cancelled), attempts, retry_reasons);
        }
        if scope.is_past_deadline() {
            return finish(Err(RetryError::DeadlineExceeded), attempts, retry_reasons);
        }

        attempts += 1;
        let error = match run_attempt(&scope, operation(attempts)).await {
            Ok(value) => {
                if attempts > 1 && config.log_retries {
                    debug!(attempts, "Operation succeeded after retry");
                }
                return finish(Ok(value), attempts, retry_reasons);
            }
            Err(Interrupt::Cancelled) => {
                return finish(Err(RetryError::Cancelled), attempts, retry_reasons);
            }
            Err(Interrupt::DeadlineExceeded) => {
                return finish(Err(RetryError::DeadlineExceeded), attempts, retry_reasons);
            }
            Err(Interrupt::Attempt(error)) => error,
        };

        let reason = error.to_string();
        retry_reasons.push(reason.clone());

        if attempts >= max_attempts {
            if config.log_retries {
                warn!(attempts, error = %reason, "Operation failed, retries exhausted");
            }
            return finish(
                Err(RetryError::Exhausted(error)),
                attempts,
                retry_reasons,
            );
        }

        let delay = config.backoff(attempts - 1);
        let notice = RetryNotice {
            attempt: attempts,
            max_attempts,
            delay,
            retryable: matches!(error, AttemptError::TimedOut(_)) || is_retryable(&reason),
            timed_out: matches!(error, AttemptError::TimedOut(_)),
            reason,
        };
        if config.log_retries {
            warn!(
                attempt = notice.attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                retryable = notice.retryable,
                error = %notice.reason,
                "Attempt failed, backing off"
            );
        }
        if let Some(observer) = scope.observer {
            observer(&notice);
        }

        tokio::select! {
            biased;
            () = cancelled(scope.cancel) => {
                return finish(Err(RetryError::Cancelled), attempts, retry_reasons);
            }
            () = deadline_reached(scope.deadline) => {
                return finish(Err(RetryError::DeadlineExceeded), attempts, retry_reasons);
            }
            () = tokio::time::sleep(delay) => {}
        }
    }
}
