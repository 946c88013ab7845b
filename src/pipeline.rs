//! End-to-end handling of a canonical event.
//!
//! A reviewer change that adds the bot triggers a full review: the diff set
//! is batched under the token budget, every batch goes through the resilient
//! client, and the aggregated result is posted back. A new comment that
//! mentions the bot, replies to it, or asks a question gets a threaded reply
//! built from the reconstructed timeline. Everything else is skipped.
//!
//! Fetching diffs and conversations is a forge concern, reached through
//! [`ChangeSource`]; posting goes through [`ReviewPoster`].

use std::fmt::{self, Write};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregate::{AggregateError, BatchResult, aggregate};
use crate::batch::{BatchConfig, CodeDiff, run_batches};
use crate::context::{
    ContextError, ResponseScenario, build_enhanced_context, build_prompt, build_timeline,
    find_target_comment,
};
use crate::llm::{LlmClient, RequestScope, ResilientClient, ResilientRequest};
use crate::providers::ReviewPoster;
use crate::types::{
    BatchId, CanonicalEvent, Comment, Commit, EventPayload, ReviewComment, ReviewResult,
    ReviewerAction,
};

/// Emoji used to acknowledge a comment before the reply is ready.
const ACK_REACTION: &str = "eyes";

const REVIEW_INSTRUCTIONS: &str = "\
Respond with a single JSON object of the form
{\"summary\": \"...\", \"comments\": [{\"file_path\": \"...\", \"line\": 1, \"content\": \"...\", \
\"severity\": \"critical|warning|info\", \"category\": \"...\", \"is_internal\": false}]}
Use an empty file_path for general remarks. Mark notes meant only for the summary as internal.
";

const REPLY_INSTRUCTIONS: &str = "\
Respond with a single JSON object of the form {\"reply\": \"...\"}.
Leave the reply empty if nothing useful can be added.
";

/// Commits and comments of one merge request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conversation {
    pub commits: Vec<Commit>,
    pub comments: Vec<Comment>,
}

/// Reads review material from the forge that raised an event.
pub trait ChangeSource: Send + Sync {
    /// The error type returned by this source.
    type Error: fmt::Display + Send;

    /// File diffs of the event's merge request.
    fn diffs(
        &self,
        event: &CanonicalEvent,
    ) -> impl Future<Output = Result<Vec<CodeDiff>, Self::Error>> + Send;

    /// Commits and comments of the event's merge request.
    fn conversation(
        &self,
        event: &CanonicalEvent,
    ) -> impl Future<Output = Result<Conversation, Self::Error>> + Send;
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{0} event carries no merge request")]
    NoMergeRequest(&'static str),

    #[error("{0} event carries no comment")]
    NoComment(&'static str),

    #[error("fetching review material failed: {0}")]
    Source(String),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    #[error("model request failed: {0}")]
    Model(String),

    #[error("posting to {provider} failed: {message}")]
    Post { provider: String, message: String },
}

/// What the pipeline did with an event.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    Reviewed(ReviewResult),
    Replied(String),
    Skipped(&'static str),
}

/// Shape the model is asked to return for one batch.
#[derive(Debug, Default, Deserialize)]
struct BatchReview {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    comments: Vec<ReviewComment>,
}

#[derive(Debug, Deserialize)]
struct ModelReply {
    #[serde(default)]
    reply: String,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Forge username of the bot, with or without a leading `@`.
    pub bot_username: String,
    pub batch: BatchConfig,
    /// Bounds each model request, retries included.
    pub request_timeout: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            bot_username: "review-relay".to_string(),
            batch: BatchConfig::default(),
            request_timeout: Some(Duration::from_secs(300)),
        }
    }
}

pub struct ReviewPipeline<C, P> {
    llm: Arc<ResilientClient<C>>,
    poster: Arc<P>,
    config: PipelineConfig,
}

impl<C, P> ReviewPipeline<C, P>
where
    C: LlmClient + 'static,
    P: ReviewPoster + Send + Sync,
{
    pub fn new(llm: Arc<ResilientClient<C>>, poster: Arc<P>, config: PipelineConfig) -> Self {
        ReviewPipeline {
            llm,
            poster,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn bot(&self) -> &str {
        self.config.bot_username.trim_start_matches('@')
    }

    fn is_bot(&self, username: &str) -> bool {
        username.eq_ignore_ascii_case(self.bot())
    }

    /// Routes an event to a review, a reply, or nothing.
    pub async fn handle_event<S: ChangeSource>(
        &self,
        event: &CanonicalEvent,
        source: &S,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutcome, PipelineError> {
        match &event.payload {
            EventPayload::ReviewerChanged {
                reviewer_change, ..
            } => {
                let requested = reviewer_change.action != ReviewerAction::Removed
                    && reviewer_change
                        .current_reviewers
                        .iter()
                        .any(|u| self.is_bot(&u.username));
                if !requested {
                    return Ok(PipelineOutcome::Skipped("bot is not a reviewer"));
                }
                let diffs = source
                    .diffs(event)
                    .await
                    .map_err(|e| PipelineError::Source(e.to_string()))?;
                self.review_merge_request(event, diffs, cancel)
                    .await
                    .map(PipelineOutcome::Reviewed)
            }
            EventPayload::CommentCreated { .. } => {
                let conversation = source
                    .conversation(event)
                    .await
                    .map_err(|e| PipelineError::Source(e.to_string()))?;
                let reply = self.reply_to_comment(event, &conversation, cancel).await?;
                Ok(reply.map_or(
                    PipelineOutcome::Skipped("comment needs no reply"),
                    PipelineOutcome::Replied,
                ))
            }
            EventPayload::MrUpdated { .. } => Ok(PipelineOutcome::Skipped("merge request update")),
        }
    }

    /// Reviews `diffs` in token-budgeted batches and posts the result.
    ///
    /// Any failed batch fails the whole review and nothing is posted.
    pub async fn review_merge_request(
        &self,
        event: &CanonicalEvent,
        diffs: Vec<CodeDiff>,
        cancel: &CancellationToken,
    ) -> Result<ReviewResult, PipelineError> {
        let mr = event
            .merge_request()
            .ok_or(PipelineError::NoMergeRequest(event.event_type()))?;
        let scope = scope_for(event);

        let batcher = self.config.batch.batcher();
        let input = batcher.batch_inputs(batcher.prepare_input(diffs));
        info!(
            repo = %event.repository.full_name,
            mr = mr.number,
            batches = input.batches.len(),
            total_tokens = input.total_tokens,
            "Starting review"
        );

        let llm = self.llm.clone();
        let title = mr.title.clone();
        let timeout = self.config.request_timeout;
        let token = cancel.clone();
        let processor = move |batch_id: BatchId, batch: Vec<CodeDiff>| {
            let llm = llm.clone();
            let cancel = token.clone();
            let mut request = ResilientRequest::new(
                scope.clone().with_batch(batch_id),
                review_prompt(&title, &batch),
            );
            if let Some(timeout) = timeout {
                request = request.with_timeout(timeout);
            }
            async move {
                let response = llm.generate_as::<BatchReview>(&request, &cancel).await;
                match response.value {
                    Some(review) if response.success => Ok(review),
                    _ => Err(response
                        .error
                        .unwrap_or_else(|| "model returned no value".to_string())),
                }
            }
        };

        let outcomes = run_batches(input.batches, processor, &self.config.batch, cancel).await;
        let results: Vec<BatchResult> = outcomes
            .into_iter()
            .map(|outcome| match outcome.result {
                Ok(review) => BatchResult {
                    batch_id: outcome.id,
                    summary: review.summary,
                    comments: review.comments,
                    error: None,
                },
                Err(e) => BatchResult::failed(outcome.id, e),
            })
            .collect();

        let review = aggregate(&results)?;
        self.poster
            .post_full_review(event, &review)
            .await
            .map_err(|e| post_error(event, e))?;

        info!(
            repo = %event.repository.full_name,
            mr = mr.number,
            comments = review.comments.len(),
            internal = review.internal_comments.len(),
            "Posted review"
        );
        Ok(review)
    }

    /// Answers the event's comment in its thread.
    ///
    /// Returns `Ok(None)` without calling the model when the comment is the
    /// bot's own or nothing in it asks for a response.
    pub async fn reply_to_comment(
        &self,
        event: &CanonicalEvent,
        conversation: &Conversation,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, PipelineError> {
        let comment = event
            .comment()
            .ok_or(PipelineError::NoComment(event.event_type()))?;
        if self.is_bot(&comment.author.username) {
            debug!(comment = %comment.id, "Skipping the bot's own comment");
            return Ok(None);
        }

        let mut comments = conversation.comments.clone();
        if !comments.iter().any(|c| c.id == comment.id) {
            comments.push(comment.clone());
        }
        let timeline = build_timeline(&conversation.commits, &comments);
        let target = find_target_comment(&timeline, &comment.id)?;

        let in_reply_to_bot = replies_to(target, &comments, |name| self.is_bot(name));
        let scenario = ResponseScenario::classify(target, self.bot(), in_reply_to_bot);
        if scenario == ResponseScenario::Default {
            debug!(comment = %comment.id, "Comment does not call for a reply");
            return Ok(None);
        }
        info!(
            repo = %event.repository.full_name,
            comment = %comment.id,
            scenario = scenario.as_str(),
            "Replying to comment"
        );

        if let Err(e) = self.poster.post_reaction(event, ACK_REACTION).await {
            warn!(comment = %comment.id, error = %e, "Failed to acknowledge comment");
        }

        let ctx = build_enhanced_context(target, &timeline);
        let mut prompt = build_prompt(&ctx, scenario);
        prompt.push_str(REPLY_INSTRUCTIONS);
        let mut request = ResilientRequest::new(scope_for(event), prompt);
        if let Some(timeout) = self.config.request_timeout {
            request = request.with_timeout(timeout);
        }

        let response = self.llm.generate_as::<ModelReply>(&request, cancel).await;
        let reply = match response.value {
            Some(reply) if response.success => reply.reply.trim().to_string(),
            _ => {
                return Err(PipelineError::Model(
                    response.error.unwrap_or_else(|| "model returned no value".into()),
                ));
            }
        };
        if reply.is_empty() {
            debug!(comment = %comment.id, "Model chose not to reply");
            return Ok(None);
        }

        self.poster
            .post_reply(event, &reply)
            .await
            .map_err(|e| post_error(event, e))?;
        Ok(Some(reply))
    }
}

fn post_error(event: &CanonicalEvent, e: impl fmt::Display) -> PipelineError {
    PipelineError::Post {
        provider: event.provider.clone(),
        message: e.to_string(),
    }
}

fn scope_for(event: &CanonicalEvent) -> RequestScope {
    let review_id = event
        .merge_request()
        .and_then(|mr| mr.id.parse().ok())
        .unwrap_or_default();
    let org_id = event.repository.id.parse().unwrap_or_default();
    RequestScope::new(review_id, org_id)
}

/// Whether `target` answers a comment written by someone matching `is_author`:
/// its direct parent, or an earlier note in the same discussion.
fn replies_to(target: &Comment, comments: &[Comment], is_author: impl Fn(&str) -> bool) -> bool {
    if let Some(parent_id) = &target.in_reply_to_id
        && let Some(parent) = comments.iter().find(|c| &c.id == parent_id)
    {
        return is_author(&parent.author.username);
    }
    let Some(discussion) = &target.discussion_id else {
        return false;
    };
    comments
        .iter()
        .take_while(|c| c.id != target.id)
        .any(|c| c.discussion_id.as_ref() == Some(discussion) && is_author(&c.author.username))
}

/// Renders the review prompt for one batch.
fn review_prompt(title: &str, diffs: &[CodeDiff]) -> String {
    let mut prompt = format!(
        "You are an AI code reviewer. Review the following changes from \"{title}\".\n\
         Report bugs, security problems and maintainability issues with exact line numbers.\n\n"
    );
    for diff in diffs {
        let _ = write!(prompt, "### {}", diff.file_path);
        if diff.is_new {
            prompt.push_str(" (new file)");
        } else if diff.is_deleted {
            prompt.push_str(" (deleted)");
        } else if diff.is_renamed
            && let Some(old) = &diff.old_file_path
        {
            let _ = write!(prompt, " (renamed from {old})");
        }
        prompt.push_str("\n```diff\n");
        for hunk in &diff.hunks {
            let _ = writeln!(
                prompt,
                "@@ -{},{} +{},{} @@",
                hunk.old_start, hunk.old_lines, hunk.new_start, hunk.new_lines
            );
            prompt.push_str(hunk.content.trim_end_matches('\n'));
            prompt.push('\n');
        }
        prompt.push_str("```\n\n");
    }
    prompt.push_str(REVIEW_INSTRUCTIONS);
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::outbound::{Posted, RecordingPoster};
    use crate::retry::RetryConfig;
    use crate::test_utils::{ScriptedClient, code_diff, comment, commit};
    use crate::types::{MergeRequest, Repository, ReviewerChange, Severity, User};

    struct StaticSource {
        diffs: Vec<CodeDiff>,
        conversation: Conversation,
    }

    impl ChangeSource for StaticSource {
        type Error = String;

        fn diffs(
            &self,
            _event: &CanonicalEvent,
        ) -> impl Future<Output = Result<Vec<CodeDiff>, Self::Error>> + Send {
            let diffs = self.diffs.clone();
            async move { Ok(diffs) }
        }

        fn conversation(
            &self,
            _event: &CanonicalEvent,
        ) -> impl Future<Output = Result<Conversation, Self::Error>> + Send {
            let conversation = self.conversation.clone();
            async move { Ok(conversation) }
        }
    }

    fn pipeline(
        script: Vec<Result<&str, &str>>,
    ) -> (ReviewPipeline<ScriptedClient, RecordingPoster>, Arc<RecordingPoster>) {
        let retry = RetryConfig::new(1, Duration::from_millis(1), Duration::from_millis(1), 2.0);
        let llm = Arc::new(ResilientClient::new(
            ScriptedClient::new(script),
            retry,
            Arc::new(crate::llm::RecordingEventSink::new()),
        ));
        let poster = Arc::new(RecordingPoster::new());
        let config = PipelineConfig {
            bot_username: "@reviewbot".into(),
            batch: BatchConfig {
                max_workers: 2,
                max_retries: 0,
                retry_delay: Duration::from_millis(1),
                max_batch_tokens: 10_000,
            },
            request_timeout: None,
        };
        (ReviewPipeline::new(llm, poster.clone(), config), poster)
    }

    fn merge_request() -> MergeRequest {
        MergeRequest {
            id: "500".into(),
            number: 7,
            title: "Add widget".into(),
            ..Default::default()
        }
    }

    fn reviewer_event(reviewer: &str, action: ReviewerAction) -> CanonicalEvent {
        CanonicalEvent {
            provider: "gitlab".into(),
            timestamp: String::new(),
            repository: Repository {
                id: "1".into(),
                full_name: "acme/widgets".into(),
                ..Default::default()
            },
            actor: User::new("2", "alice"),
            payload: EventPayload::ReviewerChanged {
                merge_request: merge_request(),
                reviewer_change: ReviewerChange {
                    action,
                    current_reviewers: vec![User::new("9", reviewer)],
                    previous_reviewers: Vec::new(),
                    changed_by: User::new("2", "alice"),
                },
            },
        }
    }

    fn comment_event(comment: Comment) -> CanonicalEvent {
        CanonicalEvent {
            provider: "gitlab".into(),
            timestamp: comment.created_at.clone(),
            repository: Repository::default(),
            actor: comment.author.clone(),
            payload: EventPayload::CommentCreated {
                comment,
                merge_request: Some(merge_request()),
            },
        }
    }

    const REVIEW: &str = r#"Here you go:
```json
{"summary": "Looks reasonable", "comments": [
  {"file_path": "src/a.rs", "line": 3, "content": "unwrap on user input", "severity": "warning"},
  {"file_path": "src/a.rs", "line": 3, "content": "panics on empty input", "severity": "critical"},
  {"file_path": "", "line": 0, "content": "tests are thin", "is_internal": true}
]}
```"#;

    #[tokio::test]
    async fn review_posts_deduplicated_result() {
        let (pipeline, poster) = pipeline(vec![Ok(REVIEW)]);
        let event = reviewer_event("reviewbot", ReviewerAction::Added);
        let diffs = vec![code_diff("src/a.rs", "+let x = input.unwrap();")];

        let review = pipeline
            .review_merge_request(&event, diffs, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(review.summary, "Looks reasonable");
        assert_eq!(review.comments.len(), 1);
        assert_eq!(review.comments[0].severity, Severity::Critical);
        assert_eq!(review.internal_comments.len(), 1);
        assert!(matches!(&poster.posted()[..], [Posted::Review { .. }]));
    }

    #[tokio::test]
    async fn failed_batch_fails_review_and_posts_nothing() {
        let (pipeline, poster) = pipeline(vec![Err("502 bad gateway"); 4]);
        let event = reviewer_event("reviewbot", ReviewerAction::Added);

        let err = pipeline
            .review_merge_request(
                &event,
                vec![code_diff("src/a.rs", "+fn a() {}")],
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Aggregate(_)));
        assert!(err.to_string().contains("Batch 1"));
        assert!(poster.posted().is_empty());
    }

    #[tokio::test]
    async fn review_requires_a_merge_request() {
        let (pipeline, _) = pipeline(Vec::new());
        let mut event = comment_event(comment("c1", "alice", "hi", ""));
        event.payload = EventPayload::CommentCreated {
            comment: comment("c1", "alice", "hi", ""),
            merge_request: None,
        };

        let err = pipeline
            .review_merge_request(&event, Vec::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NoMergeRequest("comment_created")));
    }

    #[tokio::test]
    async fn mention_gets_acknowledged_and_answered() {
        let (pipeline, poster) = pipeline(vec![Ok(r#"{"reply": "The loop is quadratic."}"#)]);
        let target = comment(
            "c2",
            "alice",
            "@reviewbot why is this slow?",
            "2024-01-01T10:00:00Z",
        );
        let conversation = Conversation {
            commits: vec![commit("abcdef0123", "add loop", "2024-01-01T09:00:00Z")],
            comments: vec![target.clone()],
        };

        let reply = pipeline
            .reply_to_comment(&comment_event(target), &conversation, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(reply.as_deref(), Some("The loop is quadratic."));
        let posted = poster.posted();
        assert!(matches!(&posted[0], Posted::Reaction { emoji, .. } if emoji == "eyes"));
        assert!(matches!(&posted[1], Posted::Reply { text, .. } if text == "The loop is quadratic."));
    }

    #[tokio::test]
    async fn reply_in_bot_thread_is_answered() {
        let (pipeline, _) = pipeline(vec![Ok(r#"{"reply": "Yes."}"#)]);
        let mut bot_note = comment("c1", "reviewbot", "Consider a map here", "2024-01-01T10:00:00Z");
        bot_note.discussion_id = Some("d1".into());
        let mut target = comment("c2", "alice", "ok, done", "2024-01-01T11:00:00Z");
        target.discussion_id = Some("d1".into());
        let conversation = Conversation {
            commits: Vec::new(),
            comments: vec![bot_note, target.clone()],
        };

        let reply = pipeline
            .reply_to_comment(&comment_event(target), &conversation, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reply.as_deref(), Some("Yes."));
    }

    #[tokio::test]
    async fn plain_comment_and_own_comment_are_skipped() {
        // An empty script fails any model call, so skipping is observable.
        let (pipeline, poster) = pipeline(Vec::new());
        let cancel = CancellationToken::new();

        let plain = comment("c1", "alice", "LGTM", "2024-01-01T10:00:00Z");
        let reply = pipeline
            .reply_to_comment(&comment_event(plain), &Conversation::default(), &cancel)
            .await
            .unwrap();
        assert_eq!(reply, None);

        let own = comment("c2", "ReviewBot", "why? @reviewbot", "2024-01-01T10:00:00Z");
        let reply = pipeline
            .reply_to_comment(&comment_event(own), &Conversation::default(), &cancel)
            .await
            .unwrap();
        assert_eq!(reply, None);
        assert!(poster.posted().is_empty());
    }

    #[tokio::test]
    async fn handle_event_routes_by_payload() {
        let (pipeline, poster) = pipeline(vec![Ok(REVIEW)]);
        let source = StaticSource {
            diffs: vec![code_diff("src/a.rs", "+let x = 1;")],
            conversation: Conversation::default(),
        };
        let cancel = CancellationToken::new();

        let outcome = pipeline
            .handle_event(&reviewer_event("someone-else", ReviewerAction::Added), &source, &cancel)
            .await
            .unwrap();
        assert_eq!(outcome, PipelineOutcome::Skipped("bot is not a reviewer"));

        let outcome = pipeline
            .handle_event(&reviewer_event("reviewbot", ReviewerAction::Removed), &source, &cancel)
            .await
            .unwrap();
        assert!(matches!(outcome, PipelineOutcome::Skipped(_)));

        let outcome = pipeline
            .handle_event(&reviewer_event("reviewbot", ReviewerAction::Added), &source, &cancel)
            .await
            .unwrap();
        assert!(matches!(outcome, PipelineOutcome::Reviewed(_)));
        assert_eq!(poster.posted().len(), 1);
    }

    #[test]
    fn review_prompt_lists_files_and_hunks() {
        let mut renamed = code_diff("src/new.rs", "+fn moved() {}");
        renamed.is_renamed = true;
        renamed.old_file_path = Some("src/old.rs".into());

        let prompt = review_prompt("Refactor", &[renamed]);
        assert!(prompt.contains("\"Refactor\""));
        assert!(prompt.contains("### src/new.rs (renamed from src/old.rs)"));
        assert!(prompt.contains("+fn moved() {}"));
        assert!(prompt.ends_with(REVIEW_INSTRUCTIONS));
    }
}
