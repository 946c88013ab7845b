//! Bitbucket Cloud webhook adapter.

use axum::http::HeaderMap;
use serde::Deserialize;
use tracing::debug;

use super::signature::verify_prefixed_signature;
use super::{ConvertError, SignatureValidator, WebhookProvider, header_str, parse_payload};
use crate::types::metadata::keys;
use crate::types::{
    CanonicalEvent, Comment, EventPayload, LineSide, MergeRequest, Metadata, Position, Repository,
    ReviewerAction, ReviewerChange, User,
};

const HEADER_EVENT: &str = "x-event-key";
const HEADER_SIGNATURE: &str = "x-hub-signature";
const HEADER_USER_AGENT: &str = "user-agent";
const HEADER_REQUEST_UUID: &str = "x-request-uuid";
const HEADER_HOOK_UUID: &str = "x-hook-uuid";

/// Event keys Bitbucket sends that this adapter recognizes.
const KNOWN_EVENT_KEYS: &[&str] = &[
    "pullrequest:comment_created",
    "pullrequest:comment_updated",
    "pullrequest:approved",
    "pullrequest:unapproved",
    "pullrequest:rejected",
    "pullrequest:created",
    "pullrequest:updated",
    "pullrequest:fulfilled",
    "repo:push",
    "repo:commit_comment_created",
];

/// Adapter for Bitbucket Cloud.
#[derive(Debug, Clone, Copy, Default)]
pub struct BitbucketProvider;

impl WebhookProvider for BitbucketProvider {
    fn name(&self) -> &'static str {
        "bitbucket"
    }

    fn can_handle(&self, headers: &HeaderMap, _body: &[u8]) -> bool {
        if let Some(key) = header_str(headers, HEADER_EVENT)
            && KNOWN_EVENT_KEYS.iter().any(|known| key.contains(known))
        {
            return true;
        }
        if header_str(headers, HEADER_USER_AGENT)
            .is_some_and(|ua| ua.to_ascii_lowercase().contains("bitbucket"))
        {
            return true;
        }
        headers.contains_key(HEADER_REQUEST_UUID) || headers.contains_key(HEADER_HOOK_UUID)
    }

    fn event_type(&self, headers: &HeaderMap, _body: &[u8]) -> Option<String> {
        header_str(headers, HEADER_EVENT).map(|k| k.trim().to_string())
    }

    fn convert(
        &self,
        event_type: &str,
        body: &[u8],
    ) -> Result<Option<CanonicalEvent>, ConvertError> {
        match event_type {
            "pullrequest:comment_created" | "pullrequest:comment_updated" => {
                convert_comment(event_type, body).map(Some)
            }
            "pullrequest:updated" => convert_update(body).map(Some),
            other => {
                debug!(event_type = other, "Ignoring Bitbucket event type");
                Ok(None)
            }
        }
    }

    fn signature_validator(&self) -> Option<&dyn SignatureValidator> {
        Some(self)
    }
}

impl SignatureValidator for BitbucketProvider {
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
struct RawHref {
    href: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawLinks {
    html: RawHref,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawUser {
    uuid: String,
    account_id: String,
    username: String,
    nickname: String,
    display_name: String,
    links: RawLinks,
}

impl From<RawUser> for User {
    fn from(raw: RawUser) -> Self {
        let id = if raw.account_id.is_empty() {
            raw.uuid.clone()
        } else {
            raw.account_id
        };
        let username = [raw.username, raw.nickname]
            .into_iter()
            .find(|s| !s.is_empty())
            .unwrap_or_else(|| raw.display_name.clone());
        let mut metadata = Metadata::new();
        metadata.insert_non_empty("uuid", &raw.uuid);
        User {
            id,
            username,
            name: raw.display_name,
            web_url: raw.links.html.href,
            avatar_url: String::new(),
            metadata,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawWorkspace {
    slug: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawRepository {
    uuid: String,
    name: String,
    full_name: String,
    links: RawLinks,
    owner: RawUser,
    workspace: RawWorkspace,
}

impl RawRepository {
    /// Workspace slug, falling back to the first segment of `full_name`.
    fn workspace_slug(&self) -> String {
        if !self.workspace.slug.is_empty() {
            return self.workspace.slug.clone();
        }
        self.full_name
            .split('/')
            .next()
            .unwrap_or_default()
            .to_string()
    }

    /// Repository slug, taken from `full_name`.
    fn repo_slug(&self) -> String {
        self.full_name
            .split_once('/')
            .map(|(_, repo)| repo.to_string())
            .unwrap_or_else(|| self.name.clone())
    }
}

impl From<RawRepository> for Repository {
    fn from(raw: RawRepository) -> Self {
        let metadata = Metadata::new().with("workspace", raw.workspace_slug());
        Repository {
            id: raw.uuid,
            name: raw.name,
            full_name: raw.full_name,
            web_url: raw.links.html.href,
            owner: raw.owner.into(),
            metadata,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawCommitRef {
    hash: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawBranchName {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawEndpoint {
    branch: RawBranchName,
    commit: RawCommitRef,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawPullRequest {
    id: u64,
    title: String,
    description: String,
    state: String,
    source: RawEndpoint,
    destination: RawEndpoint,
    author: RawUser,
    links: RawLinks,
    created_on: String,
    updated_on: String,
}

impl From<RawPullRequest> for MergeRequest {
    fn from(raw: RawPullRequest) -> Self {
        let mut metadata = Metadata::new();
        metadata.insert_non_empty(keys::HEAD_SHA, &raw.source.commit.hash);
        metadata.insert_non_empty(keys::BASE_SHA, &raw.destination.commit.hash);
        MergeRequest {
            id: raw.id.to_string(),
            number: raw.id,
            title: raw.title,
            description: raw.description,
            state: raw.state,
            source_branch: raw.source.branch.name,
            target_branch: raw.destination.branch.name,
            web_url: raw.links.html.href,
            author: raw.author.into(),
            created_at: raw.created_on,
            updated_at: raw.updated_on,
            metadata,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawContent {
    raw: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawInline {
    path: String,
    from: Option<u64>,
    to: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawParent {
    id: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawComment {
    id: u64,
    content: RawContent,
    user: RawUser,
    created_on: String,
    updated_on: String,
    parent: Option<RawParent>,
    inline: Option<RawInline>,
    links: RawLinks,
    deleted: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawReviewerChanges {
    added: Vec<RawUser>,
    removed: Vec<RawUser>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawChanges {
    reviewers: Option<RawReviewerChanges>,
}

#[derive(Debug, Deserialize)]
struct Payload {
    #[serde(default)]
    date: String,
    #[serde(default)]
    actor: RawUser,
    #[serde(default)]
    repository: RawRepository,
    pullrequest: RawPullRequest,
    #[serde(default)]
    comment: Option<RawComment>,
    #[serde(default)]
    changes: RawChanges,
}

// ─── Conversion ───

fn convert_comment(event_type: &str, body: &[u8]) -> Result<CanonicalEvent, ConvertError> {
    let payload: Payload = parse_payload(body)?;
    let Some(raw) = payload.comment else {
        return Err(ConvertError::Rejected {
            event_type: event_type.to_string(),
            reason: "missing comment object",
        });
    };
    if raw.deleted {
        return Err(ConvertError::Rejected {
            event_type: event_type.to_string(),
            reason: "comment is deleted",
        });
    }

    let id = raw.id.to_string();
    let position = raw.inline.filter(|i| !i.path.is_empty()).map(|inline| {
        let (line, side) = match (inline.to, inline.from) {
            (Some(to), _) => (Some(to), LineSide::New),
            (None, Some(from)) => (Some(from), LineSide::Old),
            (None, None) => (None, LineSide::Context),
        };
        Position {
            file_path: inline.path,
            line,
            side,
            start_line: None,
            metadata: Metadata::new(),
        }
    });

    let parent_id = raw.parent.map(|p| p.id.to_string());
    let thread_id = parent_id.clone().unwrap_or_else(|| id.clone());

    let mut metadata = Metadata::new()
        .with("workspace", payload.repository.workspace_slug())
        .with("repository", payload.repository.repo_slug())
        .with("pr_number", payload.pullrequest.id)
        .with(
            keys::COMMENT_TYPE,
            if position.is_some() { "inline" } else { "general" },
        )
        .with(keys::THREAD_ID, thread_id.clone());
    if let Some(parent) = &parent_id {
        metadata.insert(keys::PARENT_ID, parent.clone());
    }

    let comment = Comment {
        id,
        body: raw.content.raw,
        author: raw.user.into(),
        created_at: raw.created_on.clone(),
        updated_at: raw.updated_on,
        web_url: raw.links.html.href,
        in_reply_to_id: parent_id,
        discussion_id: Some(thread_id),
        position,
        system: false,
        metadata,
    };

    let timestamp = if payload.date.is_empty() {
        raw.created_on
    } else {
        payload.date
    };

    Ok(CanonicalEvent {
        provider: "bitbucket".into(),
        timestamp,
        repository: payload.repository.into(),
        actor: payload.actor.into(),
        payload: EventPayload::CommentCreated {
            comment,
            merge_request: Some(payload.pullrequest.into()),
        },
    })
}

fn convert_update(body: &[u8]) -> Result<CanonicalEvent, ConvertError> {
    let payload: Payload = parse_payload(body)?;
    let actor: User = payload.actor.into();
    let timestamp = if payload.date.is_empty() {
        payload.pullrequest.updated_on.clone()
    } else {
        payload.date
    };
    let merge_request: MergeRequest = payload.pullrequest.into();

    // Bitbucket reports added/removed sets without a single direction.
    let event_payload = match payload.changes.reviewers {
        Some(changes) => EventPayload::ReviewerChanged {
            merge_request,
            reviewer_change: ReviewerChange {
                action: ReviewerAction::Modified,
                current_reviewers: changes.added.into_iter().map(User::from).collect(),
                previous_reviewers: changes.removed.into_iter().map(User::from).collect(),
                changed_by: actor.clone(),
            },
        },
        None => EventPayload::MrUpdated { merge_request },
    };

    Ok(CanonicalEvent {
        provider: "bitbucket".into(),
        timestamp,
        repository: payload.repository.into(),
        actor,
        payload: event_payload,
    })
}
