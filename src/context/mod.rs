//! Timeline and context reconstruction around a review comment.
//!
//! Commits and comments are merged into one chronologically ordered
//! [`Timeline`]; a [`CommentContext`] is then cut out of it relative to the
//! comment being answered and rendered into a prompt.

mod extract;
mod prompt;
mod time;
mod timeline;
mod tree;

pub use extract::{
    CommentContext, ThreadAnalysis, analyze_comment_thread, build_enhanced_context,
    extract_code_context, extract_comment_context,
};
pub use prompt::{ResponseScenario, build_prompt};
pub use time::{format_timestamp, resolve_timestamp};
pub use timeline::{
    Timeline, TimelineEntry, TimelineItem, build_prev_commit_index, build_timeline,
    find_target_comment,
};
pub use tree::{CommentNode, CommentTree, Discussion, build_comment_tree};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContextError {
    #[error("target comment {0} not found in timeline")]
    NotFound(String),
}
