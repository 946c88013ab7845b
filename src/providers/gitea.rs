//! Gitea webhook adapter.
//!
//! Gitea also emits GitHub-compatible headers on some installs; a delivery
//! carrying any GitHub header is left to the GitHub adapter.

use axum::http::HeaderMap;
use serde::Deserialize;
use tracing::debug;

use super::signature::verify_hex_signature;
use super::{
    ConvertError, SignatureValidator, WebhookProvider, header_str, id_string, parse_payload,
};
use crate::types::metadata::keys;
use crate::types::{
    CanonicalEvent, Comment, EventPayload, LineSide, MergeRequest, Metadata, Position, Repository,
    User,
};

const HEADER_EVENT: &str = "x-gitea-event";
const HEADER_EVENT_TYPE: &str = "x-gitea-event-type";
const HEADER_DELIVERY: &str = "x-gitea-delivery";
const HEADER_SIGNATURE: &str = "x-gitea-signature";

const GITHUB_HEADERS: &[&str] = &["x-github-event", "x-github-delivery"];

/// Adapter for Gitea (and Forgejo) instances.
#[derive(Debug, Clone, Copy, Default)]
pub struct GiteaProvider;

impl WebhookProvider for GiteaProvider {
    fn name(&self) -> &'static str {
        "gitea"
    }

    fn can_handle(&self, headers: &HeaderMap, _body: &[u8]) -> bool {
        if GITHUB_HEADERS.iter().any(|h| headers.contains_key(*h)) {
            return false;
        }
        [HEADER_EVENT, HEADER_DELIVERY, HEADER_SIGNATURE]
            .iter()
            .any(|h| headers.contains_key(*h))
    }

    fn event_type(&self, headers: &HeaderMap, _body: &[u8]) -> Option<String> {
        header_str(headers, HEADER_EVENT_TYPE)
            .or_else(|| header_str(headers, HEADER_EVENT))
            .map(str::to_string)
    }

    fn convert(
        &self,
        event_type: &str,
        body: &[u8],
    ) -> Result<Option<CanonicalEvent>, ConvertError> {
        let payload: Payload = parse_payload(body)?;
        match event_type {
            "issue_comment" => {
                if !matches!(payload.action.as_str(), "created" | "edited") {
                    debug!(action = %payload.action, "Ignoring Gitea issue_comment action");
                    return Ok(None);
                }
                Ok(convert_comment(payload))
            }
            "pull_request_comment" | "pull_request_review_comment" => {
                if payload.action != "created" {
                    debug!(action = %payload.action, event_type, "Ignoring Gitea comment action");
                    return Ok(None);
                }
                Ok(convert_comment(payload))
            }
            "pull_request" => Ok(convert_pull_request(payload)),
            other => {
                debug!(event_type = other, "Ignoring Gitea event type");
                Ok(None)
            }
        }
    }

    fn signature_validator(&self) -> Option<&dyn SignatureValidator> {
        Some(self)
    }
}

impl SignatureValidator for GiteaProvider {
    fn signature_header(&self) -> &'static str {
        HEADER_SIGNATURE
    }

    fn verify(&self, signature: &str, body: &[u8], secret: &[u8]) -> bool {
        verify_hex_signature(body, signature, secret)
    }
}

// ─── Raw payloads ───

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawUser {
    id: u64,
    login: String,
    username: String,
    full_name: String,
    avatar_url: String,
    html_url: String,
}

impl From<RawUser> for User {
    fn from(raw: RawUser) -> Self {
        // Some hooks send `username` instead of `login`.
        let username = if raw.login.is_empty() {
            raw.username
        } else {
            raw.login
        };
        User {
            id: id_string(raw.id),
            name: if raw.full_name.is_empty() {
                username.clone()
            } else {
                raw.full_name
            },
            username,
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
    owner: RawUser,
    private: bool,
    fork: bool,
    html_url: String,
    default_branch: String,
}

impl From<RawRepository> for Repository {
    fn from(raw: RawRepository) -> Self {
        let mut metadata = Metadata::new()
            .with("private", raw.private)
            .with("fork", raw.fork);
        metadata.insert_non_empty("default_branch", &raw.default_branch);
        Repository {
            id: id_string(raw.id),
            name: raw.name,
            full_name: raw.full_name,
            web_url: raw.html_url,
            owner: raw.owner.into(),
            metadata,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawBranch {
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
    body: String,
    user: RawUser,
    state: String,
    merged: bool,
    merged_at: Option<String>,
    closed_at: Option<String>,
    created_at: String,
    updated_at: String,
    html_url: String,
    diff_url: String,
    patch_url: String,
    head: RawBranch,
    base: RawBranch,
}

impl From<RawPullRequest> for MergeRequest {
    fn from(raw: RawPullRequest) -> Self {
        let mut metadata = Metadata::new().with("merged", raw.merged);
        metadata.insert_non_empty(keys::HEAD_SHA, &raw.head.sha);
        metadata.insert_non_empty(keys::BASE_SHA, &raw.base.sha);
        metadata.insert_non_empty("diff_url", &raw.diff_url);
        metadata.insert_non_empty("patch_url", &raw.patch_url);
        if let Some(merged_at) = &raw.merged_at {
            metadata.insert_non_empty("merged_at", merged_at);
        }
        if let Some(closed_at) = &raw.closed_at {
            metadata.insert_non_empty("closed_at", closed_at);
        }
        MergeRequest {
            id: id_string(raw.id),
            number: raw.number,
            title: raw.title,
            description: raw.body,
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
    body: String,
    user: RawUser,
    state: String,
    created_at: String,
    updated_at: String,
    html_url: String,
    pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawComment {
    id: u64,
    html_url: String,
    user: RawUser,
    body: String,
    created_at: String,
    updated_at: String,
    path: String,
    diff_hunk: String,
    line: u64,
    side: String,
    start_line: u64,
    in_reply_to: u64,
    pull_request_review_id: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawReview {
    id: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Payload {
    action: String,
    pull_request: Option<RawPullRequest>,
    issue: Option<RawIssue>,
    comment: Option<RawComment>,
    review: Option<RawReview>,
    repository: RawRepository,
    sender: RawUser,
}

// ─── Conversion ───

fn issue_as_merge_request(issue: RawIssue) -> Option<MergeRequest> {
    issue.pull_request.as_ref()?;
    Some(MergeRequest {
        id: id_string(issue.id),
        number: issue.number,
        title: issue.title,
        description: issue.body,
        state: issue.state,
        web_url: issue.html_url,
        author: issue.user.into(),
        created_at: issue.created_at,
        updated_at: issue.updated_at,
        ..Default::default()
    })
}

fn convert_comment(payload: Payload) -> Option<CanonicalEvent> {
    let Some(raw) = payload.comment else {
        debug!("Gitea comment event without a comment object");
        return None;
    };

    let (head_sha, base_sha) = payload
        .pull_request
        .as_ref()
        .map(|pr| (pr.head.sha.clone(), pr.base.sha.clone()))
        .unwrap_or_default();

    let merge_request = match (payload.pull_request, payload.issue) {
        (Some(pr), _) => Some(MergeRequest::from(pr)),
        (None, Some(issue)) => issue_as_merge_request(issue),
        (None, None) => None,
    };

    let review_id = match raw.pull_request_review_id {
        0 => payload.review.map(|r| r.id).unwrap_or_default(),
        id => id,
    };
    let is_review_comment = !raw.path.is_empty();

    let mut metadata = Metadata::new().with(
        keys::COMMENT_TYPE,
        if is_review_comment {
            "review_comment"
        } else {
            "issue_comment"
        },
    );
    if review_id != 0 {
        metadata.insert("review_id", review_id);
    }
    metadata.insert_non_empty(keys::DIFF_HUNK, &raw.diff_hunk);

    let position = is_review_comment.then(|| {
        let mut position_meta = Metadata::new();
        position_meta.insert_non_empty(keys::DIFF_HUNK, &raw.diff_hunk);
        position_meta.insert_non_empty(keys::HEAD_COMMIT_SHA, &head_sha);
        position_meta.insert_non_empty(keys::BASE_COMMIT_SHA, &base_sha);
        Position {
            file_path: raw.path.clone(),
            line: (raw.line != 0).then_some(raw.line),
            side: match raw.side.as_str() {
                "LEFT" => LineSide::Old,
                _ => LineSide::New,
            },
            start_line: (raw.start_line != 0).then_some(raw.start_line),
            metadata: position_meta,
        }
    });

    let in_reply_to_id = (raw.in_reply_to != 0).then(|| raw.in_reply_to.to_string());
    let discussion_id = match (&in_reply_to_id, review_id) {
        (Some(parent), _) => Some(parent.clone()),
        (None, 0) => None,
        (None, review) => Some(format!("review-{review}")),
    };

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

    Some(CanonicalEvent {
        provider: "gitea".into(),
        timestamp: raw.created_at,
        repository: payload.repository.into(),
        actor: payload.sender.into(),
        payload: EventPayload::CommentCreated {
            comment,
            merge_request,
        },
    })
}

fn convert_pull_request(payload: Payload) -> Option<CanonicalEvent> {
    let Some(pr) = payload.pull_request else {
        debug!("Gitea pull_request event without a pull_request object");
        return None;
    };
    let mut merge_request = MergeRequest::from(pr);
    merge_request
        .metadata
        .insert_non_empty("action", &payload.action);

    Some(CanonicalEvent {
        provider: "gitea".into(),
        timestamp: merge_request.updated_at.clone(),
        repository: payload.repository.into(),
        actor: payload.sender.into(),
        payload: EventPayload::MrUpdated { merge_request },
    })
}
