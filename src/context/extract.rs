//! Context window extraction around a target comment.

use std::collections::HashSet;
use std::fmt::Write;

use chrono::{DateTime, Utc};

use super::time::{format_timestamp, resolve_timestamp};
use super::timeline::{Timeline, TimelineEntry, TimelineItem};
use crate::types::{Comment, Commit, short_sha};

/// Commits older than this many before the target are not shown.
const MAX_BEFORE_COMMITS: usize = 8;

/// Comment bodies are cut to this many characters in timeline lines.
const COMMENT_LINE_MAX: usize = 100;

/// File content excerpts are cut to this many characters.
const FILE_CONTENT_MAX: usize = 1000;

const URGENT_KEYWORDS: &[&str] = &["urgent", "asap", "immediately", "critical", "blocking"];

/// Everything known about the conversation around one comment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommentContext {
    /// `<short sha> - <subject>` lines, at most the newest eight.
    pub before_commits: Vec<String>,
    /// `[<time>] <user>: <body>` lines, including the target itself.
    pub before_comments: Vec<String>,
    pub after_commits: Vec<String>,
    pub after_comments: Vec<String>,
    pub before_timeline: Vec<TimelineItem>,
    pub after_timeline: Vec<TimelineItem>,
    /// Every comment in the timeline other than the target.
    pub related_comments: Vec<Comment>,
    pub target_time: Option<DateTime<Utc>>,
    /// Rendered code location, empty for general comments.
    pub code_context: String,
    pub analysis: Option<ThreadAnalysis>,
}

/// Shape of the thread a comment belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadAnalysis {
    pub thread_length: usize,
    pub is_continuation: bool,
    pub participant_count: usize,
    pub is_multi_participant: bool,
    pub has_questions: bool,
    pub has_urgency: bool,
}

fn commit_line(commit: &Commit) -> String {
    let subject = commit.message.lines().next().unwrap_or_default();
    format!("{} - {}", short_sha(&commit.sha, 8), subject)
}

fn comment_line(item: &TimelineItem, comment: &Comment) -> String {
    let when = item
        .at
        .map(format_timestamp)
        .unwrap_or_else(|| comment.created_at.clone());
    format!(
        "[{when}] {}: {}",
        comment.author.username,
        truncate(&comment.body, COMMENT_LINE_MAX)
    )
}

/// Cuts `s` to at most `max` characters, marking the cut with `...`.
fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let kept: String = s.chars().take(max.saturating_sub(3)).collect();
    format!("{kept}...")
}

/// Items at or before the target time (or without a time) count as before.
fn is_after(item: Option<DateTime<Utc>>, target: Option<DateTime<Utc>>) -> bool {
    matches!((item, target), (Some(i), Some(t)) if i > t)
}

/// Splits the timeline around `target`.
///
/// The target's own entry always lands in the before partition, whatever its
/// timestamp, and is never counted among the related comments.
pub fn extract_comment_context(target: &Comment, timeline: &Timeline) -> CommentContext {
    let target_time = resolve_timestamp(&target.created_at);
    let mut ctx = CommentContext {
        target_time,
        ..Default::default()
    };

    for item in &timeline.items {
        match &item.entry {
            TimelineEntry::Commit(commit) => {
                let line = commit_line(commit);
                if is_after(item.at, target_time) {
                    ctx.after_commits.push(line);
                    ctx.after_timeline.push(item.clone());
                } else {
                    ctx.before_commits.push(line);
                    ctx.before_timeline.push(item.clone());
                }
            }
            TimelineEntry::Comment(comment) => {
                let line = comment_line(item, comment);
                if comment.id == target.id {
                    ctx.before_comments.push(line);
                    ctx.before_timeline.push(item.clone());
                } else if is_after(item.at, target_time) {
                    ctx.after_comments.push(line);
                    ctx.after_timeline.push(item.clone());
                    ctx.related_comments.push(comment.clone());
                } else {
                    ctx.before_comments.push(line);
                    ctx.before_timeline.push(item.clone());
                    ctx.related_comments.push(comment.clone());
                }
            }
        }
    }

    if ctx.before_commits.len() > MAX_BEFORE_COMMITS {
        let excess = ctx.before_commits.len() - MAX_BEFORE_COMMITS;
        ctx.before_commits.drain(..excess);
    }
    ctx
}

/// Renders the code location of an inline comment; empty for general ones.
pub fn extract_code_context(comment: &Comment) -> String {
    let Some(position) = &comment.position else {
        return String::new();
    };

    let mut out = String::from("**Code Location:**\n");
    let _ = writeln!(out, "- File: {}", position.file_path);
    if let Some(line) = position.line
        && line > 0
    {
        let _ = writeln!(out, "- Line: {line}");
    }
    let _ = writeln!(out, "- Type: {}", position.side.as_str());

    if let Some(hunk) = comment.diff_hunk() {
        out.push_str("\n**Diff Context:**\n```diff\n");
        out.push_str(hunk);
        out.push_str("\n```\n");
    }

    if let Some(content) = comment.file_content() {
        out.push_str("\n**File Content:**\n```\n");
        if content.chars().count() > FILE_CONTENT_MAX {
            out.extend(content.chars().take(FILE_CONTENT_MAX));
            out.push_str("\n... (content truncated)\n");
        } else {
            out.push_str(content);
        }
        out.push_str("\n```\n");
    }
    out
}

pub fn analyze_comment_thread(comment: &Comment, related: &[Comment]) -> ThreadAnalysis {
    let participants: HashSet<&str> = std::iter::once(comment)
        .chain(related)
        .map(|c| c.author.username.as_str())
        .collect();

    let has_questions = std::iter::once(comment)
        .chain(related)
        .any(|c| c.body.contains('?'));

    let body = comment.body.to_lowercase();
    let has_urgency = URGENT_KEYWORDS.iter().any(|k| body.contains(k));

    ThreadAnalysis {
        thread_length: related.len() + 1,
        is_continuation: !related.is_empty(),
        participant_count: participants.len(),
        is_multi_participant: participants.len() > 2,
        has_questions,
        has_urgency,
    }
}

/// [`extract_comment_context`] plus code context and thread analysis.
pub fn build_enhanced_context(target: &Comment, timeline: &Timeline) -> CommentContext {
    let mut ctx = extract_comment_context(target, timeline);
    ctx.code_context = extract_code_context(target);
    ctx.analysis = Some(analyze_comment_thread(target, &ctx.related_comments));
    ctx
}
