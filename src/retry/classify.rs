//! Keyword classification of failure messages.

const RETRYABLE_MARKERS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection timeout",
    "timeout",
    "timed out",
    "temporary failure",
    "service unavailable",
    "too many requests",
    "rate limit",
    "429",
    "502",
    "503",
    "504",
    "dns lookup failed",
    "no such host",
    "network unreachable",
    "broken pipe",
    "deadline exceeded",
    "cancel",
];

/// True when the message looks like a transient failure.
///
/// Advisory only: it feeds logs and event sinks, never the retry budget.
pub fn is_retryable(message: &str) -> bool {
    let message = message.to_lowercase();
    RETRYABLE_MARKERS.iter().any(|m| message.contains(m))
}
