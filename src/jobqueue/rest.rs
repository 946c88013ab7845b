//! [`HookApi`] over the GitLab v4 and GitHub v3 REST APIs.
//!
//! Gitea and Bitbucket hooks are registered by hand; calls for those
//! providers fail with [`RestError::Unsupported`] and the queue eventually
//! discards the job.

use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::hooks::{ApiAuth, Hook, HookApi, HookSpec};
use super::worker::canonical_provider;

const USER_AGENT: &str = concat!("review-relay/", env!("CARGO_PKG_VERSION"));
const GITHUB_API: &str = "https://api.github.com";
const GITHUB_EVENTS: [&str; 4] = [
    "pull_request",
    "pull_request_review",
    "pull_request_review_comment",
    "issue_comment",
];
/// Error bodies are cut to this many bytes.
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Error)]
pub enum RestError {
    #[error("{provider} webhooks must be managed manually")]
    Unsupported { provider: String },

    #[error("{op}: request failed: {source}")]
    Transport {
        op: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{op}: HTTP {status}: {body}")]
    Status {
        op: &'static str,
        status: StatusCode,
        body: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Forge {
    GitLab,
    GitHub,
}

impl Forge {
    fn of(auth: ApiAuth<'_>) -> Result<Self, RestError> {
        match canonical_provider(auth.provider) {
            Some("gitlab") => Ok(Forge::GitLab),
            Some("github") => Ok(Forge::GitHub),
            _ => Err(RestError::Unsupported {
                provider: auth.provider.to_string(),
            }),
        }
    }

    fn api_base(self, base_url: &str) -> String {
        let base = base_url.trim().trim_end_matches('/');
        match self {
            Forge::GitLab => format!("{base}/api/v4"),
            Forge::GitHub if base.is_empty() || base == "https://github.com" => {
                GITHUB_API.to_string()
            }
            Forge::GitHub => format!("{base}/api/v3"),
        }
    }

    /// Collection URL for a project's hooks.
    fn hooks_url(self, auth: ApiAuth<'_>, project_id: &str) -> String {
        let api = self.api_base(auth.base_url);
        match self {
            Forge::GitLab => format!("{api}/projects/{project_id}/hooks"),
            Forge::GitHub if project_id.chars().all(|c| c.is_ascii_digit()) => {
                format!("{api}/repositories/{project_id}/hooks")
            }
            Forge::GitHub => format!("{api}/repos/{project_id}/hooks"),
        }
    }
}

#[derive(Deserialize)]
struct GitLabProject {
    id: u64,
}

#[derive(Deserialize)]
struct GitLabHook {
    id: u64,
    url: String,
}

#[derive(Serialize)]
struct GitLabHookBody<'a> {
    url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<&'a str>,
    merge_requests_events: bool,
    note_events: bool,
    push_events: bool,
    enable_ssl_verification: bool,
}

#[derive(Deserialize)]
struct GitHubHook {
    id: u64,
    config: GitHubHookConfig,
}

#[derive(Deserialize)]
struct GitHubHookConfig {
    #[serde(default)]
    url: String,
}

#[derive(Serialize)]
struct GitHubHookBody<'a> {
    name: &'static str,
    active: bool,
    events: &'static [&'static str],
    config: GitHubHookBodyConfig<'a>,
}

#[derive(Serialize)]
struct GitHubHookBodyConfig<'a> {
    url: &'a str,
    content_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    secret: Option<&'a str>,
    insecure_ssl: &'static str,
}

impl From<GitLabHook> for Hook {
    fn from(raw: GitLabHook) -> Self {
        Hook {
            id: raw.id.to_string(),
            url: raw.url,
        }
    }
}

impl From<GitHubHook> for Hook {
    fn from(raw: GitHubHook) -> Self {
        Hook {
            id: raw.id.to_string(),
            url: raw.config.url,
        }
    }
}

fn gitlab_body(spec: &HookSpec) -> GitLabHookBody<'_> {
    let wants = |event: &str| spec.events.iter().any(|e| e == event);
    GitLabHookBody {
        url: &spec.url,
        token: spec.secret.as_deref(),
        merge_requests_events: wants("merge_requests"),
        note_events: wants("notes"),
        push_events: false,
        enable_ssl_verification: true,
    }
}

fn github_body(spec: &HookSpec) -> GitHubHookBody<'_> {
    GitHubHookBody {
        name: "web",
        active: true,
        events: &GITHUB_EVENTS,
        config: GitHubHookBodyConfig {
            url: &spec.url,
            content_type: "json",
            secret: spec.secret.as_deref(),
            insecure_ssl: "0",
        },
    }
}

/// GitLab wants the namespaced path as a single encoded segment.
fn encode_project_path(path: &str) -> String {
    path.trim_matches('/').replace('/', "%2F")
}

fn truncate(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    body
}

/// Shared HTTP client; credentials come from each call's [`ApiAuth`].
#[derive(Debug, Clone)]
pub struct RestHooks {
    http: Client,
}

impl RestHooks {
    pub fn new(timeout: Duration) -> Result<Self, RestError> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|source| RestError::Transport {
                op: "build client",
                source,
            })?;
        Ok(RestHooks { http })
    }

    fn request(
        &self,
        forge: Forge,
        auth: ApiAuth<'_>,
        method: reqwest::Method,
        url: &str,
    ) -> RequestBuilder {
        debug!(provider = auth.provider, method = method.as_str(), url, "Forge API request");
        let builder = self.http.request(method, url);
        match forge {
            Forge::GitLab => builder.header("PRIVATE-TOKEN", auth.pat),
            Forge::GitHub => builder
                .header(reqwest::header::AUTHORIZATION, format!("token {}", auth.pat))
                .header(reqwest::header::ACCEPT, "application/vnd.github.v3+json"),
        }
    }

    async fn send(op: &'static str, request: RequestBuilder) -> Result<Response, RestError> {
        let response = request
            .send()
            .await
            .map_err(|source| RestError::Transport { op, source })?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(RestError::Status {
            op,
            status,
            body: truncate(body),
        })
    }

    async fn send_json<T: DeserializeOwned>(
        op: &'static str,
        request: RequestBuilder,
    ) -> Result<T, RestError> {
        Self::send(op, request)
            .await?
            .json()
            .await
            .map_err(|source| RestError::Transport { op, source })
    }

    async fn write_hook(
        &self,
        auth: ApiAuth<'_>,
        method: reqwest::Method,
        url: &str,
        spec: &HookSpec,
        op: &'static str,
    ) -> Result<Hook, RestError> {
        let forge = Forge::of(auth)?;
        let request = self.request(forge, auth, method, url);
        match forge {
            Forge::GitLab => {
                let hook: GitLabHook = Self::send_json(op, request.json(&gitlab_body(spec))).await?;
                Ok(hook.into())
            }
            Forge::GitHub => {
                let hook: GitHubHook = Self::send_json(op, request.json(&github_body(spec))).await?;
                Ok(hook.into())
            }
        }
    }
}

impl HookApi for RestHooks {
    type Error = RestError;

    async fn resolve_project_id(&self, auth: ApiAuth<'_>, path: &str) -> Result<String, RestError> {
        match Forge::of(auth)? {
            Forge::GitLab => {
                let url = format!(
                    "{}/projects/{}",
                    Forge::GitLab.api_base(auth.base_url),
                    encode_project_path(path)
                );
                let request = self.request(Forge::GitLab, auth, reqwest::Method::GET, &url);
                let project: GitLabProject = Self::send_json("get project", request).await?;
                Ok(project.id.to_string())
            }
            // `owner/repo` addresses the repository directly.
            Forge::GitHub => Ok(path.trim_matches('/').to_string()),
        }
    }

    async fn list_hooks(&self, auth: ApiAuth<'_>, project_id: &str) -> Result<Vec<Hook>, RestError> {
        let forge = Forge::of(auth)?;
        let url = forge.hooks_url(auth, project_id);
        let request = self.request(forge, auth, reqwest::Method::GET, &url);
        let hooks = match forge {
            Forge::GitLab => Self::send_json::<Vec<GitLabHook>>("list hooks", request)
                .await?
                .into_iter()
                .map(Hook::from)
                .collect(),
            Forge::GitHub => Self::send_json::<Vec<GitHubHook>>("list hooks", request)
                .await?
                .into_iter()
                .map(Hook::from)
                .collect(),
        };
        Ok(hooks)
    }

    async fn create_hook(
        &self,
        auth: ApiAuth<'_>,
        project_id: &str,
        spec: &HookSpec,
    ) -> Result<Hook, RestError> {
        let url = Forge::of(auth)?.hooks_url(auth, project_id);
        self.write_hook(auth, reqwest::Method::POST, &url, spec, "create hook")
            .await
    }

    async fn update_hook(
        &self,
        auth: ApiAuth<'_>,
        project_id: &str,
        hook_id: &str,
        spec: &HookSpec,
    ) -> Result<Hook, RestError> {
        let forge = Forge::of(auth)?;
        let url = format!("{}/{hook_id}", forge.hooks_url(auth, project_id));
        let method = match forge {
            Forge::GitLab => reqwest::Method::PUT,
            Forge::GitHub => reqwest::Method::PATCH,
        };
        self.write_hook(auth, method, &url, spec, "update hook").await
    }

    async fn delete_hook(
        &self,
        auth: ApiAuth<'_>,
        project_id: &str,
        hook_id: &str,
    ) -> Result<(), RestError> {
        let forge = Forge::of(auth)?;
        let url = format!("{}/{hook_id}", forge.hooks_url(auth, project_id));
        let request = self.request(forge, auth, reqwest::Method::DELETE, &url);
        match Self::send("delete hook", request).await {
            Ok(_) => Ok(()),
            Err(RestError::Status {
                status: StatusCode::NOT_FOUND,
                ..
            }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
