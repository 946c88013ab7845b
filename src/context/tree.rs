//! Nested reply trees for export and thread inspection.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::time::resolve_timestamp;
use crate::types::{Comment, Position, User};

/// A provider discussion: an ordered list of notes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Discussion {
    pub id: String,
    /// GitLab's marker for a comment that cannot be replied to.
    pub individual_note: bool,
    pub notes: Vec<Comment>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommentNode {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discussion_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub author: User,
    pub body: String,
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    /// SHA of the last commit before this comment, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_commit_sha: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<CommentNode>,
}

impl CommentNode {
    fn from_comment(comment: &Comment, discussion_id: Option<&str>) -> Self {
        CommentNode {
            id: comment.id.clone(),
            discussion_id: discussion_id.map(str::to_string),
            parent_id: None,
            author: comment.author.clone(),
            body: comment.body.clone(),
            created_at: resolve_timestamp(&comment.created_at),
            position: comment.position.clone(),
            prev_commit_sha: None,
            children: Vec::new(),
        }
    }

    fn walk_mut(&mut self, f: &mut impl FnMut(&mut CommentNode)) {
        f(self);
        for child in &mut self.children {
            child.walk_mut(f);
        }
    }

    /// Number of nodes in this subtree, including itself.
    pub fn size(&self) -> usize {
        1 + self.children.iter().map(CommentNode::size).sum::<usize>()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CommentTree {
    pub roots: Vec<CommentNode>,
}

impl CommentTree {
    /// Fills in `prev_commit_sha` from a timeline index.
    pub fn attach_prev_commits(&mut self, index: &HashMap<String, String>) {
        for root in &mut self.roots {
            root.walk_mut(&mut |node| {
                if let Some(sha) = index.get(&node.id)
                    && !sha.is_empty()
                {
                    node.prev_commit_sha = Some(sha.clone());
                }
            });
        }
    }

    pub fn len(&self) -> usize {
        self.roots.iter().map(CommentNode::size).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

/// Builds one reply chain per discussion, plus a root per standalone note.
///
/// The first note of a discussion is its root and each later note replies to
/// the one before it. Notes of an individual-note discussion are all roots.
pub fn build_comment_tree(discussions: &[Discussion], standalone: &[Comment]) -> CommentTree {
    let mut roots = Vec::new();

    for discussion in discussions {
        let mut nodes: Vec<CommentNode> = discussion
            .notes
            .iter()
            .map(|n| CommentNode::from_comment(n, Some(&discussion.id)))
            .collect();

        if discussion.individual_note {
            roots.extend(nodes);
            continue;
        }

        for i in 1..nodes.len() {
            nodes[i].parent_id = Some(nodes[i - 1].id.clone());
        }
        // Fold from the tail so each note owns its successor.
        let chain = nodes.into_iter().rev().reduce(|child, mut parent| {
            parent.children.push(child);
            parent
        });
        roots.extend(chain);
    }

    roots.extend(standalone.iter().map(|n| CommentNode::from_comment(n, None)));
    CommentTree { roots }
}
