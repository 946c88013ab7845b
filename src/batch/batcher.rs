//! Greedy token-budgeted packing of diff units.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::binary::{has_binary_extension, looks_binary};
use super::tokens::{SimpleTokenCounter, TokenCounter};

/// Hunks sampled for content-based binary detection.
const SAMPLED_HUNKS: usize = 3;

/// Bytes taken from each sampled hunk.
const HUNK_SAMPLE_BYTES: usize = 256;

/// One contiguous change region of a file diff.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffHunk {
    pub old_start: u64,
    pub old_lines: u64,
    pub new_start: u64,
    pub new_lines: u64,
    pub content: String,
}

/// The changes to one file. This is the unit the batcher packs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeDiff {
    pub file_path: String,
    #[serde(default)]
    pub hunks: Vec<DiffHunk>,
    #[serde(default)]
    pub is_new: bool,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub is_renamed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_file_path: Option<String>,
}

impl CodeDiff {
    /// Prefix of the first few hunks, used for binary sniffing.
    fn content_sample(&self) -> String {
        self.hunks
            .iter()
            .take(SAMPLED_HUNKS)
            .map(|h| {
                let mut end = h.content.len().min(HUNK_SAMPLE_BYTES);
                while !h.content.is_char_boundary(end) {
                    end -= 1;
                }
                &h.content[..end]
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchAssessment {
    pub needs_batching: bool,
    pub batch_count: usize,
    pub total_tokens: usize,
}

/// Batches in submission order, with the token total over all of them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchInput {
    pub batches: Vec<Vec<CodeDiff>>,
    pub total_tokens: usize,
}

/// Splits diff sets into batches that fit a token budget.
#[derive(Clone)]
pub struct Batcher {
    max_batch_tokens: usize,
    counter: Arc<dyn TokenCounter>,
}

impl std::fmt::Debug for Batcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batcher")
            .field("max_batch_tokens", &self.max_batch_tokens)
            .finish_non_exhaustive()
    }
}

impl Batcher {
    /// A batcher using [`SimpleTokenCounter`].
    pub fn new(max_batch_tokens: usize) -> Self {
        Self::with_counter(max_batch_tokens, Arc::new(SimpleTokenCounter))
    }

    pub fn with_counter(max_batch_tokens: usize, counter: Arc<dyn TokenCounter>) -> Self {
        Batcher {
            max_batch_tokens: max_batch_tokens.max(1),
            counter,
        }
    }

    pub fn max_batch_tokens(&self) -> usize {
        self.max_batch_tokens
    }

    /// Tokens for one unit: its path plus every hunk.
    pub fn diff_tokens(&self, diff: &CodeDiff) -> usize {
        self.counter.count_tokens(&diff.file_path)
            + diff
                .hunks
                .iter()
                .map(|h| self.counter.count_tokens(&h.content))
                .sum::<usize>()
    }

    /// Drops files that are binary by extension or content.
    pub fn prepare_input(&self, diffs: Vec<CodeDiff>) -> Vec<CodeDiff> {
        let received = diffs.len();
        let kept: Vec<CodeDiff> = diffs
            .into_iter()
            .filter(|diff| {
                let binary = has_binary_extension(&diff.file_path)
                    || (!diff.hunks.is_empty() && looks_binary(&diff.content_sample()));
                if binary {
                    info!(file = %diff.file_path, "Skipping binary or non-textual file");
                }
                !binary
            })
            .collect();
        info!(received, kept = kept.len(), "Prepared diff input");
        kept
    }

    pub fn assess(&self, diffs: &[CodeDiff]) -> BatchAssessment {
        let total_tokens: usize = diffs.iter().map(|d| self.diff_tokens(d)).sum();
        let needs_batching = total_tokens > self.max_batch_tokens;
        let batch_count = if needs_batching {
            total_tokens.div_ceil(self.max_batch_tokens)
        } else {
            1
        };
        info!(
            total_tokens,
            max_batch_tokens = self.max_batch_tokens,
            needs_batching,
            batch_count,
            "Assessed batch requirements"
        );
        BatchAssessment {
            needs_batching,
            batch_count,
            total_tokens,
        }
    }

    /// Greedy packing in input order.
    ///
    /// Input within budget, including empty input, is a single batch.
    /// A unit that would overflow a non-empty batch starts a new one. A unit
    /// larger than the whole budget gets a batch of its own; it is never
    /// split or dropped.
    pub fn batch_inputs(&self, diffs: Vec<CodeDiff>) -> BatchInput {
        let assessment = self.assess(&diffs);
        if !assessment.needs_batching {
            return BatchInput {
                batches: vec![diffs],
                total_tokens: assessment.total_tokens,
            };
        }

        let mut batches = Vec::with_capacity(assessment.batch_count);
        let mut current: Vec<CodeDiff> = Vec::new();
        let mut current_tokens = 0usize;

        for diff in diffs {
            let tokens = self.diff_tokens(&diff);
            if current_tokens + tokens > self.max_batch_tokens && !current.is_empty() {
                debug!(
                    batch = batches.len() + 1,
                    units = current.len(),
                    tokens = current_tokens,
                    "Closing batch"
                );
                batches.push(std::mem::take(&mut current));
                current_tokens = 0;
            }
            current_tokens += tokens;
            current.push(diff);
        }
        if !current.is_empty() {
            batches.push(current);
        }

        info!(
            batches = batches.len(),
            total_tokens = assessment.total_tokens,
            "Created batches"
        );
        BatchInput {
            batches,
            total_tokens: assessment.total_tokens,
        }
    }
}

impl Default for Batcher {
    fn default() -> Self {
        Batcher::new(super::BatchConfig::default().max_batch_tokens)
    }
}
