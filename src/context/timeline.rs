//! Chronological merge of commits and comments.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use super::ContextError;
use super::time::resolve_timestamp;
use crate::types::{Comment, Commit};

/// What a timeline slot holds.
#[derive(Debug, Clone, PartialEq)]
pub enum TimelineEntry {
    Commit(Commit),
    Comment(Comment),
}

/// One slot of a merge request timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineItem {
    /// Resolved timestamp; `None` when the source had none, which sorts first.
    pub at: Option<DateTime<Utc>>,
    pub entry: TimelineEntry,
}

impl TimelineItem {
    pub fn commit(&self) -> Option<&Commit> {
        match &self.entry {
            TimelineEntry::Commit(c) => Some(c),
            TimelineEntry::Comment(_) => None,
        }
    }

    pub fn comment(&self) -> Option<&Comment> {
        match &self.entry {
            TimelineEntry::Comment(c) => Some(c),
            TimelineEntry::Commit(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Timeline {
    pub items: Vec<TimelineItem>,
}

impl Timeline {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn comments(&self) -> impl Iterator<Item = &Comment> {
        self.items.iter().filter_map(TimelineItem::comment)
    }
}

/// Merges commits and comments into ascending timestamp order.
///
/// System notes are dropped. Items with equal timestamps keep their input
/// order, commits before comments.
pub fn build_timeline(commits: &[Commit], comments: &[Comment]) -> Timeline {
    let mut items: Vec<TimelineItem> = commits
        .iter()
        .map(|c| TimelineItem {
            at: resolve_timestamp(&c.timestamp),
            entry: TimelineEntry::Commit(c.clone()),
        })
        .chain(comments.iter().filter(|c| !c.system).map(|c| TimelineItem {
            at: resolve_timestamp(&c.created_at),
            entry: TimelineEntry::Comment(c.clone()),
        }))
        .collect();

    // sort_by_key is stable
    items.sort_by_key(|item| item.at);
    Timeline { items }
}

/// Looks up a comment in the timeline by id.
pub fn find_target_comment<'a>(
    timeline: &'a Timeline,
    comment_id: &str,
) -> Result<&'a Comment, ContextError> {
    timeline
        .comments()
        .find(|c| c.id == comment_id)
        .ok_or_else(|| ContextError::NotFound(comment_id.to_string()))
}

/// Maps each comment id to the SHA of the last commit preceding it.
///
/// Comments made before any commit map to an empty string.
pub fn build_prev_commit_index(timeline: &Timeline) -> HashMap<String, String> {
    let mut index = HashMap::new();
    let mut last_commit = String::new();
    for item in &timeline.items {
        match &item.entry {
            TimelineEntry::Commit(c) => last_commit.clone_from(&c.sha),
            TimelineEntry::Comment(c) if !c.id.is_empty() => {
                index.insert(c.id.clone(), last_commit.clone());
            }
            TimelineEntry::Comment(_) => {}
        }
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{commit, comment};

    #[test]
    fn merges_in_time_order_and_drops_system_notes() {
        let commits = vec![
            commit("aaa", "first", "2024-01-01T10:00:00Z"),
            commit("bbb", "second", "2024-01-01T12:00:00Z"),
        ];
        let mut system = comment("s1", "alice", "added 1 commit", "2024-01-01T12:00:01Z");
        system.system = true;
        let comments = vec![
            comment("c2", "bob", "later", "2024-01-01 13:00:00 UTC"),
            comment("c1", "alice", "early", "2024-01-01T11:00:00Z"),
            system,
        ];

        let timeline = build_timeline(&commits, &comments);
        let order: Vec<&str> = timeline
            .items
            .iter()
            .map(|i| match &i.entry {
                TimelineEntry::Commit(c) => c.sha.as_str(),
                TimelineEntry::Comment(c) => c.id.as_str(),
            })
            .collect();
        assert_eq!(order, vec!["aaa", "c1", "bbb", "c2"]);
    }

    #[test]
    fn equal_timestamps_keep_input_order() {
        let ts = "2024-01-01T10:00:00Z";
        let comments = vec![
            comment("x", "a", "1", ts),
            comment("y", "b", "2", ts),
            comment("z", "c", "3", ts),
        ];
        let timeline = build_timeline(&[], &comments);
        let ids: Vec<_> = timeline.comments().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["x", "y", "z"]);
    }

    #[test]
    fn missing_timestamps_sort_first() {
        let comments = vec![
            comment("dated", "a", "1", "2024-01-01T10:00:00Z"),
            comment("undated", "b", "2", ""),
        ];
        let timeline = build_timeline(&[], &comments);
        assert_eq!(timeline.items[0].comment().unwrap().id, "undated");
    }

    #[test]
    fn find_target_reports_missing_id() {
        let timeline = build_timeline(&[], &[comment("c1", "a", "hi", "2024-01-01T10:00:00Z")]);
        assert_eq!(find_target_comment(&timeline, "c1").unwrap().body, "hi");
        assert_eq!(
            find_target_comment(&timeline, "nope"),
            Err(ContextError::NotFound("nope".into()))
        );
    }

    #[test]
    fn prev_commit_index_tracks_last_commit() {
        let commits = vec![
            commit("aaa", "first", "2024-01-01T10:00:00Z"),
            commit("bbb", "second", "2024-01-01T12:00:00Z"),
        ];
        let comments = vec![
            comment("c0", "a", "before anything", "2024-01-01T09:00:00Z"),
            comment("c1", "a", "after first", "2024-01-01T11:00:00Z"),
            comment("c2", "a", "after second", "2024-01-01T13:00:00Z"),
        ];
        let index = build_prev_commit_index(&build_timeline(&commits, &comments));
        assert_eq!(index["c0"], "");
        assert_eq!(index["c1"], "aaa");
        assert_eq!(index["c2"], "bbb");
    }
}
