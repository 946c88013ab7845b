//! Outbound posting contract.
//!
//! Concrete REST clients live outside this crate; the core only needs these
//! three operations and relies on them tolerating at-least-once redelivery.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Mutex;

use crate::types::{CanonicalEvent, ReviewResult};

/// Posts results back to the forge that raised an event.
pub trait ReviewPoster {
    /// The error type returned by this poster.
    type Error: std::fmt::Display + Send;

    /// Replies in the thread of the event's comment.
    fn post_reply(
        &self,
        event: &CanonicalEvent,
        text: &str,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Reacts to the event's comment (e.g. an "eyes" acknowledgement).
    fn post_reaction(
        &self,
        event: &CanonicalEvent,
        emoji: &str,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Posts a full review: summary plus inline comments.
    fn post_full_review(
        &self,
        event: &CanonicalEvent,
        review: &ReviewResult,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// What a [`RecordingPoster`] was asked to post.
#[derive(Debug, Clone, PartialEq)]
pub enum Posted {
    Reply { target: String, text: String },
    Reaction { target: String, emoji: String },
    Review { target: String, review: ReviewResult },
}

/// In-memory poster that records calls and drops exact repeats.
#[derive(Debug, Default)]
pub struct RecordingPoster {
    posted: Mutex<Vec<Posted>>,
    seen: Mutex<HashSet<String>>,
}

impl RecordingPoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything posted so far, in call order.
    pub fn posted(&self) -> Vec<Posted> {
        self.posted
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    fn record(&self, key: String, item: Posted) {
        let Ok(mut seen) = self.seen.lock() else {
            return;
        };
        if seen.insert(key)
            && let Ok(mut posted) = self.posted.lock()
        {
            posted.push(item);
        }
    }
}

/// Stable target for an event: the comment if present, else the MR.
fn target_of(event: &CanonicalEvent) -> String {
    match (event.comment(), event.merge_request()) {
        (Some(comment), _) => format!("{}:comment:{}", event.provider, comment.id),
        (None, Some(mr)) => format!("{}:mr:{}", event.provider, mr.id),
        (None, None) => format!("{}:repo:{}", event.provider, event.repository.full_name),
    }
}

impl ReviewPoster for RecordingPoster {
    type Error = std::convert::Infallible;

    fn post_reply(
        &self,
        event: &CanonicalEvent,
        text: &str,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        let target = target_of(event);
        self.record(
            format!("reply|{target}|{text}"),
            Posted::Reply {
                target,
                text: text.to_string(),
            },
        );
        async { Ok(()) }
    }

    fn post_reaction(
        &self,
        event: &CanonicalEvent,
        emoji: &str,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        let target = target_of(event);
        self.record(
            format!("reaction|{target}|{emoji}"),
            Posted::Reaction {
                target,
                emoji: emoji.to_string(),
            },
        );
        async { Ok(()) }
    }

    fn post_full_review(
        &self,
        event: &CanonicalEvent,
        review: &ReviewResult,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        let target = target_of(event);
        self.record(
            format!("review|{target}|{}", review.summary),
            Posted::Review {
                target,
                review: review.clone(),
            },
        );
        async { Ok(()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Comment, EventPayload, Repository, User};

    fn event() -> CanonicalEvent {
        CanonicalEvent {
            provider: "gitea".into(),
            timestamp: String::new(),
            repository: Repository::default(),
            actor: User::default(),
            payload: EventPayload::CommentCreated {
                comment: Comment {
                    id: "5".into(),
                    ..Default::default()
                },
                merge_request: None,
            },
        }
    }

    #[tokio::test]
    async fn redelivered_posts_are_dropped() {
        let poster = RecordingPoster::new();
        let event = event();

        poster.post_reaction(&event, "eyes").await.unwrap();
        poster.post_reply(&event, "Looks fine").await.unwrap();
        poster.post_reply(&event, "Looks fine").await.unwrap();

        let posted = poster.posted();
        assert_eq!(posted.len(), 2);
        assert_eq!(
            posted[1],
            Posted::Reply {
                target: "gitea:comment:5".into(),
                text: "Looks fine".into()
            }
        );
    }
}
