//! Merges per-batch review output into one result.
//!
//! Aggregation is all-or-nothing: a single failed batch fails the whole
//! review. Comments are deduplicated on `(file_path, line)` keeping the
//! most severe; on equal severity the first one seen wins. Internal notes
//! are split out after deduplication.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::types::{BatchId, ReviewComment, ReviewResult};

/// Summary returned when no batch produced anything.
pub const EMPTY_SUMMARY: &str = "No results were produced.";

/// Output of one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchResult {
    pub batch_id: BatchId,
    pub summary: String,
    pub comments: Vec<ReviewComment>,
    pub error: Option<String>,
}

impl BatchResult {
    pub fn failed(batch_id: BatchId, error: impl Into<String>) -> Self {
        BatchResult {
            batch_id,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AggregateError {
    #[error("errors in batch processing: {}", .0.join("; "))]
    BatchFailures(Vec<String>),
}

/// Combines batch results; see the module docs for the rules.
pub fn aggregate(results: &[BatchResult]) -> Result<ReviewResult, AggregateError> {
    if results.is_empty() {
        warn!("No batch results to aggregate");
        return Ok(ReviewResult {
            summary: EMPTY_SUMMARY.to_string(),
            ..Default::default()
        });
    }

    let failures: Vec<String> = results
        .iter()
        .enumerate()
        .filter_map(|(i, r)| {
            r.error.as_ref().map(|e| {
                error!(batch = i + 1, error = %e, "Batch failed");
                format!("{}: {e}", BatchId::from_index(i))
            })
        })
        .collect();
    if !failures.is_empty() {
        return Err(AggregateError::BatchFailures(failures));
    }

    let summary = combine_summaries(results);
    let pooled = results.iter().flat_map(|r| r.comments.iter().cloned());
    let total = results.iter().map(|r| r.comments.len()).sum::<usize>();
    let (internal_comments, comments): (Vec<_>, Vec<_>) =
        deduplicate(pooled).into_iter().partition(|c| c.is_internal);

    info!(
        batches = results.len(),
        total,
        external = comments.len(),
        internal = internal_comments.len(),
        "Aggregated batch results"
    );

    Ok(ReviewResult {
        summary,
        comments,
        internal_comments,
    })
}

fn combine_summaries(results: &[BatchResult]) -> String {
    if let [only] = results {
        return only.summary.clone();
    }
    results
        .iter()
        .enumerate()
        .filter(|(_, r)| !r.summary.trim().is_empty())
        .map(|(i, r)| format!("## {}\n\n{}", BatchId::from_index(i), r.summary.trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Keeps one comment per [`ReviewComment::dedup_key`], in first-seen order.
///
/// General remarks only collapse when their text is identical.
pub fn deduplicate(comments: impl IntoIterator<Item = ReviewComment>) -> Vec<ReviewComment> {
    let mut kept: Vec<ReviewComment> = Vec::new();
    let mut slots: HashMap<(String, u64, String), usize> = HashMap::new();

    for comment in comments {
        let (file, line, text) = comment.dedup_key();
        let key = (file.to_string(), line, text.to_string());
        match slots.entry(key) {
            Entry::Occupied(slot) => {
                let existing = &mut kept[*slot.get()];
                if comment.severity.rank() > existing.severity.rank() {
                    *existing = comment;
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(kept.len());
                kept.push(comment);
            }
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Severity;
    use proptest::prelude::*;

    fn comment(file: &str, line: u64, severity: &str, content: &str) -> ReviewComment {
        ReviewComment {
            file_path: file.into(),
            line,
            content: content.into(),
            severity: Severity::from(severity),
            ..Default::default()
        }
    }

    fn batch(n: usize, summary: &str, comments: Vec<ReviewComment>) -> BatchResult {
        BatchResult {
            batch_id: BatchId(n),
            summary: summary.into(),
            comments,
            error: None,
        }
    }

    #[test]
    fn empty_input_is_a_sentinel_not_an_error() {
        let result = aggregate(&[]).unwrap();
        assert_eq!(result.summary, EMPTY_SUMMARY);
        assert!(result.comments.is_empty());
    }

    #[test]
    fn any_failure_fails_everything() {
        let results = vec![
            BatchResult::failed(BatchId(1), "timeout"),
            batch(2, "ok", vec![comment("a.rs", 1, "info", "x")]),
            BatchResult::failed(BatchId(3), "json_processing_failed"),
        ];
        let err = aggregate(&results).unwrap_err();
        assert_eq!(
            err.to_string(),
            "errors in batch processing: Batch 1: timeout; Batch 3: json_processing_failed"
        );
    }

    #[test]
    fn critical_beats_warning_at_same_location() {
        let results = vec![
            batch(1, "", vec![comment("a.rs", 10, "warning", "first")]),
            batch(2, "", vec![comment("a.rs", 10, "critical", "second")]),
        ];
        let review = aggregate(&results).unwrap();
        assert_eq!(review.comments.len(), 1);
        assert_eq!(review.comments[0].severity, Severity::Critical);
        assert_eq!(review.comments[0].content, "second");
    }

    #[test]
    fn equal_severity_keeps_first_seen() {
        let kept = deduplicate(vec![
            comment("a.rs", 1, "warning", "first"),
            comment("b.rs", 2, "info", "other"),
            comment("a.rs", 1, "warning", "second"),
        ]);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].content, "first");
        assert_eq!(kept[1].content, "other");
    }

    #[test]
    fn general_comments_from_different_batches_survive() {
        let results = vec![
            batch(1, "", vec![comment("", 0, "info", "Consider adding tests.")]),
            batch(2, "", vec![comment("", 0, "warning", "The migration is irreversible.")]),
            batch(3, "", vec![comment("", 0, "info", "Consider adding tests.")]),
        ];
        let review = aggregate(&results).unwrap();
        let contents: Vec<_> = review.comments.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(
            contents,
            vec!["Consider adding tests.", "The migration is irreversible."]
        );
    }

    #[test]
    fn internal_comments_are_split_after_dedup() {
        let mut internal = comment("a.rs", 5, "critical", "internal");
        internal.is_internal = true;
        let results = vec![batch(
            1,
            "summary",
            vec![
                comment("a.rs", 5, "info", "external"),
                internal,
                comment("c.rs", 1, "info", "kept"),
            ],
        )];

        let review = aggregate(&results).unwrap();
        assert_eq!(review.summary, "summary");
        assert_eq!(review.internal_comments.len(), 1);
        assert_eq!(review.internal_comments[0].content, "internal");
        assert_eq!(review.comments.len(), 1);
        assert_eq!(review.comments[0].content, "kept");
    }

    #[test]
    fn multiple_batches_get_headings() {
        let results = vec![
            batch(1, "first part", vec![]),
            batch(2, "  ", vec![]),
            batch(3, "third part\n", vec![]),
        ];
        let review = aggregate(&results).unwrap();
        assert_eq!(
            review.summary,
            "## Batch 1\n\nfirst part\n\n## Batch 3\n\nthird part"
        );
    }

    fn arb_comment() -> impl Strategy<Value = ReviewComment> {
        (
            prop::sample::select(vec!["a.rs", "b.rs", "c.rs"]),
            0u64..5,
            prop::sample::select(vec!["critical", "warning", "info", "style"]),
            "[a-z]{1,8}",
        )
            .prop_map(|(file, line, severity, content)| comment(file, line, severity, &content))
    }

    proptest! {
        #[test]
        fn dedup_keeps_one_max_severity_comment_per_location(
            comments in prop::collection::vec(arb_comment(), 0..40)
        ) {
            let kept = deduplicate(comments.clone());

            let mut keys: Vec<_> = kept.iter().map(|c| (c.file_path.clone(), c.line)).collect();
            let unique = keys.len();
            keys.sort();
            keys.dedup();
            prop_assert_eq!(keys.len(), unique);

            for c in &kept {
                let max = comments
                    .iter()
                    .filter(|o| o.dedup_key() == c.dedup_key())
                    .map(|o| o.severity.rank())
                    .max()
                    .unwrap();
                prop_assert_eq!(c.severity.rank(), max);
            }
        }

        #[test]
        fn internal_notes_never_reach_inline_comments(
            comments in prop::collection::vec(crate::test_utils::arb_review_comment(), 0..30)
        ) {
            let review = aggregate(&[BatchResult { comments, ..Default::default() }]).unwrap();
            prop_assert!(review.comments.iter().all(|c| !c.is_internal));
            prop_assert!(review.internal_comments.iter().all(|c| c.is_internal));
        }
    }
}
