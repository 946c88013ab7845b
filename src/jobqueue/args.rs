//! Job kinds and their immutable arguments.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::{ConnectorId, JobId};

/// What a job does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    WebhookInstall,
    WebhookRemoval,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::WebhookInstall => "webhook_install",
            JobKind::WebhookRemoval => "webhook_removal",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "webhook_install" => Ok(JobKind::WebhookInstall),
            "webhook_removal" => Ok(JobKind::WebhookRemoval),
            other => Err(format!("unknown job kind {other:?}")),
        }
    }
}

/// Arguments shared by webhook install and removal.
///
/// `project_path` is either a numeric provider id or a namespaced path
/// such as `group/sub/project`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookArgs {
    pub connector_id: ConnectorId,
    pub project_path: String,
    pub provider: String,
    pub base_url: String,
    pub pat: String,
}

// The token stays out of logs.
impl fmt::Debug for WebhookArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookArgs")
            .field("connector_id", &self.connector_id)
            .field("project_path", &self.project_path)
            .field("provider", &self.provider)
            .field("base_url", &self.base_url)
            .field("pat", &"<redacted>")
            .finish()
    }
}

impl WebhookArgs {
    /// Last path segment, used as the display name.
    pub fn project_name(&self) -> &str {
        self.project_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.project_path)
    }
}

/// Lifecycle of a persisted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Available,
    Running,
    Completed,
    /// Failed, waiting for `scheduled_at` to be retried.
    Retryable,
    /// Failed with no attempts left.
    Discarded,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Available => "available",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Retryable => "retryable",
            JobState::Discarded => "discarded",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Discarded)
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(JobState::Available),
            "running" => Ok(JobState::Running),
            "completed" => Ok(JobState::Completed),
            "retryable" => Ok(JobState::Retryable),
            "discarded" => Ok(JobState::Discarded),
            other => Err(format!("unknown job state {other:?}")),
        }
    }
}

/// A job as stored.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub args: WebhookArgs,
    pub state: JobState,
    /// Runs started so far, including the current one.
    pub attempt: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
}
