//! GitHub webhook adapter.
//!
//! Handles `issue_comment`, `pull_request_review_comment`,
//! `pull_request_review` and `pull_request` deliveries. Unknown event types
//! and uninteresting actions are ignored rather than treated as errors.

use axum::http::HeaderMap;
use chrono::Utc;
use serde::Deserialize;
use tracing::debug;

use super::signature::verify_prefixed_signature;
use super::{
    ConvertError, SignatureValidator, WebhookProvider, header_str, id_string, parse_payload,
};
use crate::types::metadata::keys;
use crate::types::{
    CanonicalEvent, Comment, EventPayload, LineSide, MergeRequest, Metadata, Position, Repository,
    ReviewerAction, ReviewerChange, User,
};

const HEADER_EVENT: &str = "x-github-event";
const HEADER_SIGNATURE: &str = "x-hub-signature-256";

/// Adapter for github.com and GitHub Enterprise.
#[derive(Debug, Clone, Copy, Default)]
pub struct GitHubProvider;

impl WebhookProvider for GitHubProvider {
    fn name(&self) -> &'static str {
        "github"
    }

    fn can_handle(&self, headers: &HeaderMap, _body: &[u8]) -> bool {
        headers.contains_key(HEADER_EVENT)
    }

    fn event_type(&self, headers: &HeaderMap, _body: &[u8]) -> Option<String> {
        header_str(headers, HEADER_EVENT).map(str::to_string)
    }

    fn convert(
        &self,
        event_type: &str,
        body: &[u8],
    ) -> Result<Option<CanonicalEvent>, ConvertError> {
        match event_type {
            "issue_comment" => convert_issue_comment(body),
            "pull_request_review_comment" => convert_review_comment(body),
            "pull_request_review" => convert_review(body),
            "pull_request" => convert_pull_request(body),
            other => {
                debug!(event_type = other, "Ignoring GitHub event type");
                Ok(None)
            }
        }
    }

    fn signature_validator(&self) -> Option<&dyn SignatureValidator> {
        Some(self)
    }
}

impl SignatureValidator for GitHubProvider {
    fn signature_header(&self) -> &'static str {
        HEADER_SIGNATURE
    }

    fn verify(&self, signature: &str, body: &[u8], secret: &[u8]) -> bool {
        verify_prefixed_signature(body, signature, secret)
    }
}

// ─── Raw payloads ───

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawUser {
    id: u64,
    login: String,
    name: Option<String>,
    html_url: String,
    avatar_url: String,
}

impl From<RawUser> for User {
    fn from(raw: RawUser) -> Self {
        User {
            id: id_string(raw.id),
            name: raw.name.unwrap_or_else(|| raw.login.clone()),
            username: raw.login,
            web_url: raw.html_url,
            avatar_url: raw.avatar_url,
            metadata: Metadata::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawRepository {
    id: u64,
    name: String,
    full_name: String,
    html_url: String,
    owner: RawUser,
    private: bool,
}

impl From<RawRepository> for Repository {
    fn from(raw: RawRepository) -> Self {
        Repository {
            id: id_string(raw.id),
            name: raw.name,
            full_name: raw.full_name,
            web_url: raw.html_url,
            owner: raw.owner.into(),
            metadata: Metadata::new().with("private", raw.private),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawRef {
    #[serde(rename = "ref")]
    name: String,
    sha: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawPullRequest {
    id: u64,
    number: u64,
    title: String,
    body: Option<String>,
    state: String,
    html_url: String,
    created_at: String,
    updated_at: String,
    user: RawUser,
    head: RawRef,
    base: RawRef,
    merged: bool,
    requested_reviewers: Vec<RawUser>,
}

impl From<RawPullRequest> for MergeRequest {
    fn from(raw: RawPullRequest) -> Self {
        let mut metadata = Metadata::new();
        metadata.insert_non_empty(keys::HEAD_SHA, &raw.head.sha);
        metadata.insert_non_empty(keys::BASE_SHA, &raw.base.sha);
        metadata.insert("merged", raw.merged);
        MergeRequest {
            id: id_string(raw.id),
            number: raw.number,
            title: raw.title,
            description: raw.body.unwrap_or_default(),
            state: raw.state,
            source_branch: raw.head.name,
            target_branch: raw.base.name,
            web_url: raw.html_url,
            author: raw.user.into(),
            created_at: raw.created_at,
            updated_at: raw.updated_at,
            metadata,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawIssue {
    id: u64,
    number: u64,
    title: String,
    body: Option<String>,
    state: String,
    html_url: String,
    created_at: String,
    updated_at: String,
    user: RawUser,
    pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawComment {
    id: u64,
    body: String,
    user: RawUser,
    created_at: String,
    updated_at: String,
    html_url: String,
    path: Option<String>,
    line: Option<u64>,
    original_line: Option<u64>,
    start_line: Option<u64>,
    side: Option<String>,
    diff_hunk: String,
    pull_request_review_id: Option<u64>,
    in_reply_to_id: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct IssueCommentPayload {
    action: String,
    comment: RawComment,
    issue: RawIssue,
    repository: RawRepository,
    #[serde(default)]
    sender: RawUser,
}

#[derive(Debug, Deserialize)]
struct ReviewCommentPayload {
    action: String,
    comment: RawComment,
    pull_request: RawPullRequest,
    repository: RawRepository,
    #[serde(default)]
    sender: RawUser,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawReview {
    id: u64,
    body: Option<String>,
    user: RawUser,
    submitted_at: Option<String>,
    html_url: String,
}

#[derive(Debug, Deserialize)]
struct ReviewPayload {
    action: String,
    review: RawReview,
    pull_request: RawPullRequest,
    repository: RawRepository,
}

#[derive(Debug, Deserialize)]
struct PullRequestPayload {
    action: String,
    pull_request: RawPullRequest,
    repository: RawRepository,
    #[serde(default)]
    sender: RawUser,
    #[serde(default)]
    requested_reviewer: Option<RawUser>,
}

// ─── Conversion ───

fn convert_issue_comment(body: &[u8]) -> Result<Option<CanonicalEvent>, ConvertError> {
    let payload: IssueCommentPayload = parse_payload(body)?;
    if payload.action != "created" {
        debug!(action = %payload.action, "Ignoring GitHub issue_comment action");
        return Ok(None);
    }

    let issue = payload.issue;
    let merge_request = issue.pull_request.is_some().then(|| MergeRequest {
        id: id_string(issue.id),
        number: issue.number,
        title: issue.title,
        description: issue.body.unwrap_or_default(),
        state: issue.state,
        web_url: issue.html_url,
        author: issue.user.into(),
        created_at: issue.created_at,
        updated_at: issue.updated_at,
        ..Default::default()
    });

    let raw = payload.comment;
    let comment = Comment {
        id: id_string(raw.id),
        body: raw.body,
        author: raw.user.into(),
        created_at: raw.created_at.clone(),
        updated_at: raw.updated_at,
        web_url: raw.html_url,
        metadata: Metadata::new().with(keys::COMMENT_TYPE, "issue_comment"),
        ..Default::default()
    };

    Ok(Some(CanonicalEvent {
        provider: "github".into(),
        timestamp: raw.created_at,
        repository: payload.repository.into(),
        actor: payload.sender.into(),
        payload: EventPayload::CommentCreated {
            comment,
            merge_request,
        },
    }))
}

fn convert_review_comment(body: &[u8]) -> Result<Option<CanonicalEvent>, ConvertError> {
    let payload: ReviewCommentPayload = parse_payload(body)?;
    if payload.action != "created" {
        debug!(action = %payload.action, "Ignoring GitHub pull_request_review_comment action");
        return Ok(None);
    }

    let raw = payload.comment;
    let mut metadata = Metadata::new().with(keys::COMMENT_TYPE, "review_comment");
    metadata.insert_non_empty(keys::DIFF_HUNK, &raw.diff_hunk);

    let review_id = raw.pull_request_review_id.filter(|id| *id != 0);
    if let Some(review_id) = review_id {
        metadata.insert(keys::REVIEW_ID, review_id);
        metadata.insert(keys::THREAD_ID, review_id.to_string());
    }

    let in_reply_to_id = raw.in_reply_to_id.map(|id| id.to_string());
    let discussion_id = match (&in_reply_to_id, review_id) {
        (Some(parent), _) => {
            metadata.insert(keys::PARENT_ID, parent.clone());
            Some(parent.clone())
        }
        (None, Some(review_id)) => Some(format!("review-{review_id}")),
        (None, None) => None,
    };

    let position = raw.path.filter(|p| !p.is_empty()).map(|path| Position {
        file_path: path,
        line: raw.line.or(raw.original_line),
        side: match raw.side.as_deref() {
            Some("LEFT") => LineSide::Old,
            _ => LineSide::New,
        },
        start_line: raw.start_line.filter(|l| *l != 0),
        metadata: Metadata::new(),
    });

    let comment = Comment {
        id: id_string(raw.id),
        body: raw.body,
        author: raw.user.into(),
        created_at: raw.created_at.clone(),
        updated_at: raw.updated_at,
        web_url: raw.html_url,
        in_reply_to_id,
        discussion_id,
        position,
        system: false,
        metadata,
    };

    Ok(Some(CanonicalEvent {
        provider: "github".into(),
        timestamp: raw.created_at,
        repository: payload.repository.into(),
        actor: payload.sender.into(),
        payload: EventPayload::CommentCreated {
            comment,
            merge_request: Some(payload.pull_request.into()),
        },
    }))
}

fn convert_review(body: &[u8]) -> Result<Option<CanonicalEvent>, ConvertError> {
    let payload: ReviewPayload = parse_payload(body)?;
    let review_body = payload.review.body.unwrap_or_default();
    if payload.action != "submitted" || review_body.is_empty() {
        debug!(
            action = %payload.action,
            has_body = !review_body.is_empty(),
            "Ignoring GitHub pull_request_review"
        );
        return Ok(None);
    }

    let timestamp = payload
        .review
        .submitted_at
        .unwrap_or_else(|| Utc::now().to_rfc3339());
    let author: User = payload.review.user.into();
    let comment = Comment {
        id: id_string(payload.review.id),
        body: review_body,
        author: author.clone(),
        created_at: timestamp.clone(),
        web_url: payload.review.html_url,
        metadata: Metadata::new().with(keys::COMMENT_TYPE, "review"),
        ..Default::default()
    };

    Ok(Some(CanonicalEvent {
        provider: "github".into(),
        timestamp,
        repository: payload.repository.into(),
        actor: author,
        payload: EventPayload::CommentCreated {
            comment,
            merge_request: Some(payload.pull_request.into()),
        },
    }))
}

fn convert_pull_request(body: &[u8]) -> Result<Option<CanonicalEvent>, ConvertError> {
    let payload: PullRequestPayload = parse_payload(body)?;
    let timestamp = if payload.pull_request.updated_at.is_empty() {
        Utc::now().to_rfc3339()
    } else {
        payload.pull_request.updated_at.clone()
    };
    let actor: User = payload.sender.into();

    let action = match payload.action.as_str() {
        "review_requested" => Some(ReviewerAction::Added),
        "review_request_removed" => Some(ReviewerAction::Removed),
        _ => None,
    };

    let event_payload = match action {
        Some(action) => {
            let mut pr = payload.pull_request;
            let current_reviewers = std::mem::take(&mut pr.requested_reviewers)
                .into_iter()
                .map(User::from)
                .collect();
            let previous_reviewers = match (action, payload.requested_reviewer) {
                (ReviewerAction::Removed, Some(removed)) => vec![removed.into()],
                _ => Vec::new(),
            };
            EventPayload::ReviewerChanged {
                merge_request: pr.into(),
                reviewer_change: ReviewerChange {
                    action,
                    current_reviewers,
                    previous_reviewers,
                    changed_by: actor.clone(),
                },
            }
        }
        None => EventPayload::MrUpdated {
            merge_request: payload.pull_request.into(),
        },
    };

    Ok(Some(CanonicalEvent {
        provider: "github".into(),
        timestamp,
        repository: payload.repository.into(),
        actor,
        payload: event_payload,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn repository() -> serde_json::Value {
        json!({
            "id": 1,
            "name": "widgets",
            "full_name": "acme/widgets",
            "html_url": "https://github.com/acme/widgets",
            "owner": {"id": 10, "login": "acme"}
        })
    }

    fn pull_request() -> serde_json::Value {
        json!({
            "id": 500,
            "number": 7,
            "title": "Add widget",
            "body": "Adds a widget",
            "state": "open",
            "html_url": "https://github.com/acme/widgets/pull/7",
            "user": {"id": 2, "login": "alice"},
            "head": {"ref": "feature", "sha": "aaa"},
            "base": {"ref": "main", "sha": "bbb"},
            "requested_reviewers": [{"id": 3, "login": "bob"}]
        })
    }

    fn convert(event: &str, body: serde_json::Value) -> Option<CanonicalEvent> {
        GitHubProvider
            .convert(event, &serde_json::to_vec(&body).unwrap())
            .unwrap()
    }

    #[test]
    fn issue_comment_on_pull_request_attaches_merge_request() {
        let event = convert(
            "issue_comment",
            json!({
                "action": "created",
                "comment": {
                    "id": 99,
                    "body": "@bot please review",
                    "user": {"id": 2, "login": "alice"},
                    "created_at": "2024-03-01T10:00:00Z"
                },
                "issue": {
                    "id": 500, "number": 7, "title": "Add widget",
                    "pull_request": {"url": "https://api.github.com/..."}
                },
                "repository": repository(),
                "sender": {"id": 2, "login": "alice"}
            }),
        )
        .unwrap();

        assert_eq!(event.event_type(), "comment_created");
        let comment = event.comment().unwrap();
        assert_eq!(comment.id, "99");
        assert_eq!(comment.metadata.str(keys::COMMENT_TYPE), Some("issue_comment"));
        assert_eq!(event.merge_request().unwrap().number, 7);
        assert_eq!(event.repository.full_name, "acme/widgets");
    }

    #[test]
    fn issue_comment_on_plain_issue_has_no_merge_request() {
        let event = convert(
            "issue_comment",
            json!({
                "action": "created",
                "comment": {"id": 1, "body": "hi", "user": {"id": 2, "login": "alice"}},
                "issue": {"id": 5, "number": 3, "title": "Bug"},
                "repository": repository()
            }),
        )
        .unwrap();
        assert!(event.merge_request().is_none());
    }

    #[test]
    fn edited_comment_is_ignored() {
        let event = convert(
            "issue_comment",
            json!({
                "action": "edited",
                "comment": {"id": 1, "body": "hi", "user": {"id": 2, "login": "alice"}},
                "issue": {"id": 5, "number": 3, "title": "Bug"},
                "repository": repository()
            }),
        );
        assert!(event.is_none());
    }

    #[test]
    fn review_comment_reply_threads_on_parent() {
        let event = convert(
            "pull_request_review_comment",
            json!({
                "action": "created",
                "comment": {
                    "id": 12,
                    "body": "why?",
                    "user": {"id": 3, "login": "bob"},
                    "path": "src/lib.rs",
                    "line": 42,
                    "side": "RIGHT",
                    "diff_hunk": "@@ -40,3 +40,4 @@",
                    "pull_request_review_id": 77,
                    "in_reply_to_id": 11,
                    "created_at": "2024-03-01T10:05:00Z"
                },
                "pull_request": pull_request(),
                "repository": repository()
            }),
        )
        .unwrap();

        let comment = event.comment().unwrap();
        assert_eq!(comment.in_reply_to_id.as_deref(), Some("11"));
        assert_eq!(comment.discussion_id.as_deref(), Some("11"));
        assert_eq!(comment.metadata.str(keys::PARENT_ID), Some("11"));
        assert_eq!(comment.metadata.i64(keys::REVIEW_ID), Some(77));
        assert_eq!(comment.diff_hunk(), Some("@@ -40,3 +40,4 @@"));

        let position = comment.position.as_ref().unwrap();
        assert_eq!(position.file_path, "src/lib.rs");
        assert_eq!(position.line, Some(42));
        assert_eq!(position.side, LineSide::New);
    }

    #[test]
    fn top_level_review_comment_threads_on_review() {
        let event = convert(
            "pull_request_review_comment",
            json!({
                "action": "created",
                "comment": {
                    "id": 12, "body": "nit", "user": {"id": 3, "login": "bob"},
                    "path": "a.rs", "line": 1, "pull_request_review_id": 77
                },
                "pull_request": pull_request(),
                "repository": repository()
            }),
        )
        .unwrap();
        assert_eq!(
            event.comment().unwrap().discussion_id.as_deref(),
            Some("review-77")
        );
    }

    #[test]
    fn review_without_body_is_ignored() {
        let body = json!({
            "action": "submitted",
            "review": {"id": 1, "body": null, "user": {"id": 3, "login": "bob"}},
            "pull_request": pull_request(),
            "repository": repository()
        });
        assert!(convert("pull_request_review", body).is_none());
    }

    #[test]
    fn review_requested_becomes_reviewer_change() {
        let event = convert(
            "pull_request",
            json!({
                "action": "review_requested",
                "pull_request": pull_request(),
                "repository": repository(),
                "sender": {"id": 2, "login": "alice"},
                "requested_reviewer": {"id": 3, "login": "bob"}
            }),
        )
        .unwrap();

        let change = event.reviewer_change().unwrap();
        assert_eq!(change.action, ReviewerAction::Added);
        assert_eq!(change.current_reviewers[0].username, "bob");
        assert_eq!(change.changed_by.username, "alice");
    }

    #[test]
    fn other_pull_request_actions_are_updates() {
        let event = convert(
            "pull_request",
            json!({
                "action": "synchronize",
                "pull_request": pull_request(),
                "repository": repository()
            }),
        )
        .unwrap();
        assert_eq!(event.event_type(), "mr_updated");
        let mr = event.merge_request().unwrap();
        assert_eq!(mr.source_branch, "feature");
        assert_eq!(mr.metadata.str(keys::HEAD_SHA), Some("aaa"));
    }

    #[test]
    fn unknown_event_is_ignored() {
        assert!(convert("ping", json!({"zen": "hi"})).is_none());
    }

    #[test]
    fn malformed_payload_is_an_error() {
        let result = GitHubProvider.convert("issue_comment", b"not json");
        assert!(matches!(result, Err(ConvertError::Json(_))));
    }
}
