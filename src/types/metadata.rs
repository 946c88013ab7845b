//! Open metadata bag attached to canonical entities.
//!
//! Each forge ships fields that have no provider-agnostic meaning (a GitHub
//! review id, a Gitea base commit, a Bitbucket workspace). Rather than growing
//! a typed field per provider, those values live in a string-keyed bag and are
//! read back through the typed accessors below.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Well-known metadata keys shared by adapters and the context builder.
pub mod keys {
    pub const DIFF_HUNK: &str = "diff_hunk";
    pub const FILE_CONTENT: &str = "file_content";
    pub const COMMENT_TYPE: &str = "comment_type";
    pub const PARENT_ID: &str = "parent_id";
    pub const THREAD_ID: &str = "thread_id";
    pub const REVIEW_ID: &str = "pull_request_review_id";
    pub const HEAD_COMMIT_SHA: &str = "head_commit_sha";
    pub const BASE_COMMIT_SHA: &str = "base_commit_sha";
    pub const HEAD_SHA: &str = "head_sha";
    pub const BASE_SHA: &str = "base_sha";
}

/// String-keyed side channel for provider-specific values.
///
/// Iteration order is the key order, so serialized output is stable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, Value>);

impl Metadata {
    pub fn new() -> Self {
        Metadata(BTreeMap::new())
    }

    /// Inserts a value, replacing any previous value for the key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Builder form of [`Metadata::insert`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Inserts only when the string is non-empty.
    ///
    /// Adapters use this for optional payload fields so that absent values
    /// never show up as empty strings.
    pub fn insert_non_empty(&mut self, key: impl Into<String>, value: &str) {
        if !value.is_empty() {
            self.insert(key, value);
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Returns the value as a string slice, if it is a JSON string.
    pub fn str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Returns a non-empty string value.
    pub fn non_empty_str(&self, key: &str) -> Option<&str> {
        self.str(key).filter(|s| !s.is_empty())
    }

    /// Returns the value as a signed integer.
    ///
    /// Numeric strings are accepted too: some forges send ids as strings.
    pub fn i64(&self, key: &str) -> Option<i64> {
        match self.0.get(key)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

impl FromIterator<(String, Value)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Metadata(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn typed_accessors_read_matching_types() {
        let meta = Metadata::new()
            .with("hunk", "@@ -1 +1 @@")
            .with("review", 42)
            .with("merged", true);

        assert_eq!(meta.str("hunk"), Some("@@ -1 +1 @@"));
        assert_eq!(meta.i64("review"), Some(42));
        assert_eq!(meta.bool("merged"), Some(true));
    }

    #[test]
    fn typed_accessors_reject_mismatched_types() {
        let meta = Metadata::new().with("review", 42).with("flag", "yes");

        assert_eq!(meta.str("review"), None);
        assert_eq!(meta.bool("flag"), None);
        assert_eq!(meta.i64("missing"), None);
    }

    #[test]
    fn numeric_strings_parse_as_integers() {
        let meta = Metadata::new().with("id", "1234");
        assert_eq!(meta.i64("id"), Some(1234));
    }

    #[test]
    fn insert_non_empty_skips_empty_strings() {
        let mut meta = Metadata::new();
        meta.insert_non_empty("a", "");
        meta.insert_non_empty("b", "value");

        assert!(!meta.contains("a"));
        assert_eq!(meta.non_empty_str("b"), Some("value"));
    }

    #[test]
    fn serializes_as_plain_object() {
        let meta = Metadata::new().with("b", 2).with("a", "x");
        let value = serde_json::to_value(&meta).unwrap();
        assert_eq!(value, json!({"a": "x", "b": 2}));
    }
}
