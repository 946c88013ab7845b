//! Review output returned by the model and posted back to the forge.

use serde::{Deserialize, Serialize};

/// Severity of a review comment.
///
/// Anything the model emits that is not `critical` or `warning` is treated
/// as informational.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Severity {
    Critical,
    Warning,
    #[default]
    Info,
    Other(String),
}

impl Severity {
    /// Ranking used by deduplication: critical=3, warning=2, anything else=1.
    pub fn rank(&self) -> u8 {
        match self {
            Severity::Critical => 3,
            Severity::Warning => 2,
            Severity::Info | Severity::Other(_) => 1,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Severity::Critical => "critical",
            Severity::Warning => "warning",
            Severity::Info => "info",
            Severity::Other(s) => s,
        }
    }
}

impl From<String> for Severity {
    fn from(s: String) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "critical" => Severity::Critical,
            "warning" => Severity::Warning,
            "info" => Severity::Info,
            _ => Severity::Other(s),
        }
    }
}

impl From<&str> for Severity {
    fn from(s: &str) -> Self {
        Severity::from(s.to_string())
    }
}

impl From<Severity> for String {
    fn from(s: Severity) -> Self {
        s.as_str().to_string()
    }
}

/// A single review finding.
///
/// An empty `file_path` marks a general comment not anchored to a file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReviewComment {
    #[serde(default)]
    pub file_path: String,
    #[serde(default)]
    pub line: u64,
    pub content: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub category: String,
    /// Internal notes are kept for the summary and never posted inline.
    #[serde(default)]
    pub is_internal: bool,
}

impl ReviewComment {
    pub fn location(&self) -> (&str, u64) {
        (&self.file_path, self.line)
    }

    /// A remark about the change as a whole rather than a file.
    pub fn is_general(&self) -> bool {
        self.file_path.is_empty()
    }

    /// Deduplication key: the location, plus the text for general remarks,
    /// which all share the empty location.
    pub fn dedup_key(&self) -> (&str, u64, &str) {
        let text = if self.is_general() { self.content.as_str() } else { "" };
        (&self.file_path, self.line, text)
    }
}

/// Final result of a review run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReviewResult {
    pub summary: String,
    #[serde(default)]
    pub comments: Vec<ReviewComment>,
    #[serde(default)]
    pub internal_comments: Vec<ReviewComment>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ranks() {
        assert_eq!(Severity::from("critical").rank(), 3);
        assert_eq!(Severity::from("WARNING").rank(), 2);
        assert_eq!(Severity::from("info").rank(), 1);
        assert_eq!(Severity::from("nitpick").rank(), 1);
    }

    #[test]
    fn unknown_severity_survives_serialization() {
        let comment: ReviewComment = serde_json::from_str(
            r#"{"file_path":"a.rs","line":3,"content":"x","severity":"style"}"#,
        )
        .unwrap();
        assert_eq!(comment.severity, Severity::Other("style".into()));

        let json = serde_json::to_value(&comment).unwrap();
        assert_eq!(json["severity"], "style");
    }

    #[test]
    fn missing_fields_default() {
        let comment: ReviewComment = serde_json::from_str(r#"{"content":"general"}"#).unwrap();
        assert_eq!(comment.location(), ("", 0));
        assert!(comment.is_general());
        assert_eq!(comment.dedup_key(), ("", 0, "general"));
        assert_eq!(comment.severity, Severity::Info);
        assert!(!comment.is_internal);
    }
}
