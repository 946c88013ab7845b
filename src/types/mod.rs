//! Provider-agnostic domain types.
//!
//! Everything downstream of the provider adapters reads and writes these
//! shapes only.

pub mod event;
pub mod ids;
pub mod metadata;
pub mod review;

pub use event::{
    CanonicalEvent, Comment, Commit, EventPayload, LineSide, MergeRequest, Position, Repository,
    ReviewerAction, ReviewerChange, User,
};
pub use ids::{BatchId, ConnectorId, JobId, short_sha};
pub use metadata::Metadata;
pub use review::{ReviewComment, ReviewResult, Severity};
