//! Canonical event model.
//!
//! Every forge payload is projected onto these shapes. The typed core covers
//! what every provider has in common; provider-specific extras are kept in the
//! [`Metadata`] bag of the sub-entity they belong to.

use serde::{Deserialize, Serialize};

use super::Metadata;

/// A forge user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub web_url: String,
    #[serde(default)]
    pub avatar_url: String,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

impl User {
    /// Creates a user with only the identifying fields populated.
    pub fn new(id: impl Into<String>, username: impl Into<String>) -> Self {
        User {
            id: id.into(),
            username: username.into(),
            ..Default::default()
        }
    }
}

/// A repository (GitHub/Gitea/Bitbucket) or project (GitLab).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    pub id: String,
    pub name: String,
    /// Path including the namespace, e.g. `group/sub/project`.
    pub full_name: String,
    #[serde(default)]
    pub web_url: String,
    #[serde(default)]
    pub owner: User,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

/// A pull request or merge request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeRequest {
    pub id: String,
    /// The per-repository number (`#42`, `!42`).
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub source_branch: String,
    #[serde(default)]
    pub target_branch: String,
    #[serde(default)]
    pub web_url: String,
    #[serde(default)]
    pub author: User,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

/// Which side of a diff an inline comment is anchored to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineSide {
    Old,
    #[default]
    New,
    Context,
}

impl LineSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineSide::Old => "old",
            LineSide::New => "new",
            LineSide::Context => "context",
        }
    }
}

/// Inline-diff anchor for a code comment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub file_path: String,
    pub line: Option<u64>,
    #[serde(default)]
    pub side: LineSide,
    /// First line of a multi-line comment range.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_line: Option<u64>,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

/// A review or discussion comment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub body: String,
    pub author: User,
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default)]
    pub web_url: String,
    /// Direct parent, for providers with explicit reply chains.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to_id: Option<String>,
    /// Thread grouping key, shared by every note of a discussion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discussion_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    /// Forge-generated notes ("added 2 commits", "approved this").
    #[serde(default)]
    pub system: bool,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

/// Direction of a reviewer change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewerAction {
    Added,
    Removed,
    /// The provider reports a before/after set without a direction.
    Modified,
}

/// A change to the reviewer set of a merge request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewerChange {
    pub action: ReviewerAction,
    #[serde(default)]
    pub current_reviewers: Vec<User>,
    #[serde(default)]
    pub previous_reviewers: Vec<User>,
    #[serde(default)]
    pub changed_by: User,
}

/// A commit, as seen on a merge request timeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub sha: String,
    pub message: String,
    #[serde(default)]
    pub author: User,
    pub timestamp: String,
    #[serde(default)]
    pub web_url: String,
}

/// The occurrence-specific part of a canonical event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventPayload {
    CommentCreated {
        comment: Comment,
        /// Absent for comments on plain issues.
        merge_request: Option<MergeRequest>,
    },
    ReviewerChanged {
        merge_request: MergeRequest,
        reviewer_change: ReviewerChange,
    },
    MrUpdated {
        merge_request: MergeRequest,
    },
}

impl EventPayload {
    /// Wire name of the event type.
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::CommentCreated { .. } => "comment_created",
            EventPayload::ReviewerChanged { .. } => "reviewer_changed",
            EventPayload::MrUpdated { .. } => "mr_updated",
        }
    }
}

/// A provider-agnostic webhook occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    /// Provider namespace (`github`, `gitlab`, `gitea`, `bitbucket`).
    pub provider: String,
    /// Raw provider timestamp of the occurrence.
    pub timestamp: String,
    pub repository: Repository,
    pub actor: User,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl CanonicalEvent {
    pub fn event_type(&self) -> &'static str {
        self.payload.kind()
    }

    pub fn comment(&self) -> Option<&Comment> {
        match &self.payload {
            EventPayload::CommentCreated { comment, .. } => Some(comment),
            _ => None,
        }
    }

    pub fn merge_request(&self) -> Option<&MergeRequest> {
        match &self.payload {
            EventPayload::CommentCreated { merge_request, .. } => merge_request.as_ref(),
            EventPayload::ReviewerChanged { merge_request, .. } => Some(merge_request),
            EventPayload::MrUpdated { merge_request } => Some(merge_request),
        }
    }

    pub fn reviewer_change(&self) -> Option<&ReviewerChange> {
        match &self.payload {
            EventPayload::ReviewerChanged {
                reviewer_change, ..
            } => Some(reviewer_change),
            _ => None,
        }
    }
}

impl Comment {
    /// Unified diff hunk the comment was made on, if the provider sent one.
    pub fn diff_hunk(&self) -> Option<&str> {
        self.metadata
            .non_empty_str(super::metadata::keys::DIFF_HUNK)
            .or_else(|| {
                self.position
                    .as_ref()
                    .and_then(|p| p.metadata.non_empty_str(super::metadata::keys::DIFF_HUNK))
            })
    }

    /// File content snapshot attached by a data fetcher, if any.
    pub fn file_content(&self) -> Option<&str> {
        self.metadata
            .non_empty_str(super::metadata::keys::FILE_CONTENT)
    }
}
