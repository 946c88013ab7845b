//! Newtype wrappers for identifiers that cross module boundaries.
//!
//! These keep a connector id from being passed where a job id is expected and
//! give each identifier one canonical display form.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a configured integration (one forge account/installation).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectorId(pub String);

impl ConnectorId {
    pub fn new(s: impl Into<String>) -> Self {
        ConnectorId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectorId {
    fn from(s: String) -> Self {
        ConnectorId(s)
    }
}

impl From<&str> for ConnectorId {
    fn from(s: &str) -> Self {
        ConnectorId(s.to_string())
    }
}

/// Row id of a persisted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for JobId {
    fn from(n: i64) -> Self {
        JobId(n)
    }
}

/// One-based batch number, displayed as `Batch <n>`.
///
/// Used only for diagnostics and combined-summary headings.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct BatchId(pub usize);

impl BatchId {
    /// Batch id for the zero-based position of a batch in its run.
    pub fn from_index(index: usize) -> Self {
        BatchId(index + 1)
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Batch {}", self.0)
    }
}

/// Returns the first `len` characters of a commit SHA, or the whole string
/// when it is shorter.
pub fn short_sha(sha: &str, len: usize) -> &str {
    sha.get(..len).unwrap_or(sha)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn connector_id_serializes_transparently(s in "[a-z0-9-]{1,36}") {
            let id = ConnectorId::new(&s);
            let json = serde_json::to_string(&id).unwrap();
            prop_assert_eq!(json, format!("\"{}\"", s));
        }

        #[test]
        fn batch_id_display_is_one_based(index in 0usize..10_000) {
            prop_assert_eq!(
                BatchId::from_index(index).to_string(),
                format!("Batch {}", index + 1)
            );
        }
    }

    #[test]
    fn short_sha_truncates() {
        assert_eq!(short_sha("0123456789abcdef", 8), "01234567");
    }

    #[test]
    fn short_sha_handles_short_input() {
        assert_eq!(short_sha("abc", 8), "abc");
    }
}
