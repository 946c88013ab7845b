//! GitLab webhook adapter.
//!
//! GitLab identifies itself with `X-Gitlab-Event`/`X-Gitlab-Token`, but some
//! relays strip those headers, so detection falls back to `object_kind`.
//! The "signature" is the shared secret sent verbatim as `X-Gitlab-Token`.

use axum::http::HeaderMap;
use serde::Deserialize;
use tracing::debug;

use super::signature::verify_token;
use super::{
    ConvertError, SignatureValidator, WebhookProvider, header_str, id_string, parse_payload,
};
use crate::types::metadata::keys;
use crate::types::{
    CanonicalEvent, Comment, EventPayload, LineSide, MergeRequest, Metadata, Position, Repository,
    ReviewerAction, ReviewerChange, User,
};

const HEADER_EVENT: &str = "x-gitlab-event";
const HEADER_TOKEN: &str = "x-gitlab-token";

const NOTE_HOOK: &str = "Note Hook";
const MERGE_REQUEST_HOOK: &str = "Merge Request Hook";

/// `object_kind` values that only GitLab sends.
const OBJECT_KINDS: &[&str] = &[
    "merge_request",
    "note",
    "push",
    "tag_push",
    "issue",
    "wiki_page",
];

/// Adapter for gitlab.com and self-managed GitLab.
#[derive(Debug, Clone, Copy, Default)]
pub struct GitLabProvider;

#[derive(Deserialize)]
struct EventKind {
    #[serde(default)]
    object_kind: String,
}

fn object_kind(body: &[u8]) -> Option<String> {
    serde_json::from_slice::<EventKind>(body)
        .ok()
        .map(|p| p.object_kind)
        .filter(|k| !k.is_empty())
}

impl WebhookProvider for GitLabProvider {
    fn name(&self) -> &'static str {
        "gitlab"
    }

    fn can_handle(&self, headers: &HeaderMap, body: &[u8]) -> bool {
        if headers.contains_key(HEADER_EVENT) || headers.contains_key(HEADER_TOKEN) {
            return true;
        }
        object_kind(body).is_some_and(|kind| OBJECT_KINDS.contains(&kind.as_str()))
    }

    fn event_type(&self, headers: &HeaderMap, body: &[u8]) -> Option<String> {
        if let Some(event) = header_str(headers, HEADER_EVENT) {
            return Some(event.to_string());
        }
        let hook = match object_kind(body)?.as_str() {
            "note" => NOTE_HOOK,
            "merge_request" => MERGE_REQUEST_HOOK,
            "push" => "Push Hook",
            "tag_push" => "Tag Push Hook",
            "issue" => "Issue Hook",
            "wiki_page" => "Wiki Page Hook",
            _ => return None,
        };
        Some(hook.to_string())
    }

    fn convert(
        &self,
        event_type: &str,
        body: &[u8],
    ) -> Result<Option<CanonicalEvent>, ConvertError> {
        match event_type {
            NOTE_HOOK => convert_note(body).map(Some),
            MERGE_REQUEST_HOOK => convert_merge_request(body).map(Some),
            other => {
                debug!(event_type = other, "Ignoring GitLab event type");
                Ok(None)
            }
        }
    }

    fn signature_validator(&self) -> Option<&dyn SignatureValidator> {
        Some(self)
    }
}

impl SignatureValidator for GitLabProvider {
    fn signature_header(&self) -> &'static str {
        HEADER_TOKEN
    }

    fn verify(&self, signature: &str, _body: &[u8], secret: &[u8]) -> bool {
        verify_token(signature, secret)
    }
}

// ─── Raw payloads ───

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct RawUser {
    id: u64,
    name: String,
    username: String,
    avatar_url: String,
    web_url: String,
}

impl From<RawUser> for User {
    fn from(raw: RawUser) -> Self {
        User {
            id: id_string(raw.id),
            username: raw.username,
            name: raw.name,
            web_url: raw.web_url,
            avatar_url: raw.avatar_url,
            metadata: Metadata::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawProject {
    id: u64,
    name: String,
    web_url: String,
    namespace: String,
    path_with_namespace: String,
    default_branch: String,
}

impl From<RawProject> for Repository {
    fn from(raw: RawProject) -> Self {
        let owner = raw
            .path_with_namespace
            .split('/')
            .next()
            .unwrap_or_default()
            .to_string();
        let mut metadata = Metadata::new();
        metadata.insert_non_empty("namespace", &raw.namespace);
        metadata.insert_non_empty("default_branch", &raw.default_branch);
        Repository {
            id: id_string(raw.id),
            name: raw.name,
            full_name: raw.path_with_namespace,
            web_url: raw.web_url,
            owner: User {
                username: owner,
                ..Default::default()
            },
            metadata,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawLastCommit {
    id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawMergeRequest {
    id: u64,
    iid: u64,
    title: String,
    description: Option<String>,
    state: String,
    source_branch: String,
    target_branch: String,
    url: String,
    web_url: String,
    author_id: u64,
    created_at: String,
    updated_at: String,
    action: String,
    last_commit: RawLastCommit,
}

impl From<RawMergeRequest> for MergeRequest {
    fn from(raw: RawMergeRequest) -> Self {
        let mut metadata = Metadata::new();
        metadata.insert_non_empty(keys::HEAD_SHA, &raw.last_commit.id);
        metadata.insert_non_empty("action", &raw.action);
        MergeRequest {
            id: id_string(raw.id),
            number: raw.iid,
            title: raw.title,
            description: raw.description.unwrap_or_default(),
            state: raw.state,
            source_branch: raw.source_branch,
            target_branch: raw.target_branch,
            web_url: if raw.url.is_empty() { raw.web_url } else { raw.url },
            author: User {
                id: id_string(raw.author_id),
                ..Default::default()
            },
            created_at: raw.created_at,
            updated_at: raw.updated_at,
            metadata,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawNotePosition {
    new_path: Option<String>,
    old_path: Option<String>,
    new_line: Option<u64>,
    old_line: Option<u64>,
    head_sha: String,
    base_sha: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawNote {
    id: u64,
    note: String,
    noteable_type: String,
    created_at: String,
    updated_at: String,
    url: String,
    discussion_id: Option<String>,
    system: bool,
    #[serde(rename = "type")]
    note_type: Option<String>,
    line_code: Option<String>,
    position: Option<RawNotePosition>,
}

#[derive(Debug, Deserialize)]
struct NotePayload {
    #[serde(default)]
    user: RawUser,
    #[serde(default)]
    project: RawProject,
    object_attributes: RawNote,
    #[serde(default)]
    merge_request: Option<RawMergeRequest>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawChange<T> {
    previous: Vec<T>,
    current: Vec<T>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawChanges {
    reviewers: Option<RawChange<RawUser>>,
    reviewer_ids: Option<RawChange<u64>>,
}

#[derive(Debug, Deserialize)]
struct MergeRequestPayload {
    #[serde(default)]
    user: RawUser,
    #[serde(default)]
    project: RawProject,
    object_attributes: RawMergeRequest,
    #[serde(default)]
    changes: RawChanges,
}

// ─── Conversion ───

fn convert_note(body: &[u8]) -> Result<CanonicalEvent, ConvertError> {
    let payload: NotePayload = parse_payload(body)?;
    let note = payload.object_attributes;

    let position = note.position.and_then(|p| {
        let (file_path, line, side) = match (p.new_path, p.new_line, p.old_path, p.old_line) {
            (Some(path), Some(line), _, _) => (path, Some(line), LineSide::New),
            (_, _, Some(path), Some(line)) => (path, Some(line), LineSide::Old),
            (Some(path), None, _, _) => (path, None, LineSide::Context),
            _ => return None,
        };
        let mut metadata = Metadata::new();
        metadata.insert_non_empty(keys::HEAD_COMMIT_SHA, &p.head_sha);
        metadata.insert_non_empty(keys::BASE_COMMIT_SHA, &p.base_sha);
        Some(Position {
            file_path,
            line,
            side,
            start_line: None,
            metadata,
        })
    });

    let mut metadata = Metadata::new();
    metadata.insert_non_empty("noteable_type", &note.noteable_type);
    if let Some(note_type) = &note.note_type {
        metadata.insert_non_empty(keys::COMMENT_TYPE, note_type);
    }
    if let Some(line_code) = &note.line_code {
        metadata.insert_non_empty("line_code", line_code);
    }

    let author: User = payload.user.into();
    let comment = Comment {
        id: id_string(note.id),
        body: note.note,
        author: author.clone(),
        created_at: note.created_at.clone(),
        updated_at: note.updated_at,
        web_url: note.url,
        in_reply_to_id: None,
        discussion_id: note.discussion_id.filter(|d| !d.is_empty()),
        position,
        system: note.system,
        metadata,
    };

    let merge_request = payload
        .merge_request
        .filter(|_| note.noteable_type.is_empty() || note.noteable_type == "MergeRequest")
        .map(MergeRequest::from);

    Ok(CanonicalEvent {
        provider: "gitlab".into(),
        timestamp: note.created_at,
        repository: payload.project.into(),
        actor: author,
        payload: EventPayload::CommentCreated {
            comment,
            merge_request,
        },
    })
}

fn reviewer_direction(added: bool, removed: bool) -> ReviewerAction {
    match (added, removed) {
        (true, false) => ReviewerAction::Added,
        (false, true) => ReviewerAction::Removed,
        _ => ReviewerAction::Modified,
    }
}

fn convert_merge_request(body: &[u8]) -> Result<CanonicalEvent, ConvertError> {
    let payload: MergeRequestPayload = parse_payload(body)?;
    let actor: User = payload.user.into();
    let timestamp = payload.object_attributes.updated_at.clone();
    let merge_request: MergeRequest = payload.object_attributes.into();

    let reviewer_change = match (payload.changes.reviewers, payload.changes.reviewer_ids) {
        (Some(change), _) => {
            let added = change
                .current
                .iter()
                .any(|c| !change.previous.iter().any(|p| p.id == c.id));
            let removed = change
                .previous
                .iter()
                .any(|p| !change.current.iter().any(|c| c.id == p.id));
            Some(ReviewerChange {
                action: reviewer_direction(added, removed),
                current_reviewers: change.current.into_iter().map(User::from).collect(),
                previous_reviewers: change.previous.into_iter().map(User::from).collect(),
                changed_by: actor.clone(),
            })
        }
        (None, Some(ids)) => {
            let added = ids.current.iter().any(|c| !ids.previous.contains(c));
            let removed = ids.previous.iter().any(|p| !ids.current.contains(p));
            let as_users = |v: Vec<u64>| -> Vec<User> {
                v.into_iter()
                    .map(|id| User {
                        id: id_string(id),
                        ..Default::default()
                    })
                    .collect()
            };
            Some(ReviewerChange {
                action: reviewer_direction(added, removed),
                current_reviewers: as_users(ids.current),
                previous_reviewers: as_users(ids.previous),
                changed_by: actor.clone(),
            })
        }
        (None, None) => None,
    };

    let event_payload = match reviewer_change {
        Some(reviewer_change) => EventPayload::ReviewerChanged {
            merge_request,
            reviewer_change,
        },
        None => EventPayload::MrUpdated { merge_request },
    };

    Ok(CanonicalEvent {
        provider: "gitlab".into(),
        timestamp,
        repository: payload.project.into(),
        actor,
        payload: event_payload,
    })
}
