//! Durable, at-least-once background jobs.
//!
//! Jobs are persisted in SQLite and claimed by a [`JobRunner`]. Workers are
//! idempotent: a job may run more than once (after a crash or a failed
//! attempt) without creating duplicate provider-side state. Failed runs are
//! rescheduled with exponential backoff until their attempts run out.

mod args;
mod config;
mod hooks;
mod queue;
mod rest;
mod store;
mod worker;

pub use args::{Job, JobKind, JobState, WebhookArgs};
pub use config::QueueConfig;
pub use hooks::{ApiAuth, Hook, HookApi, HookSpec, InMemoryHooks};
pub use queue::JobRunner;
pub use rest::{RestError, RestHooks};
pub use store::{JobStore, RegistryRecord, RegistryStatus, StoreError};
pub use worker::{
    JobError, WEBHOOK_EVENTS, WEBHOOK_NAME, canonical_provider, endpoint_url, install_webhook,
    legacy_endpoint_url, remove_webhook,
};
