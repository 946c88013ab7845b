//! Webhook install and removal workers.
//!
//! Workers hold no state between runs and never retry internally; a failed
//! run is rescheduled by the queue and starts again from scratch. Every
//! step is safe to repeat: existing hooks are found by URL and updated in
//! place, and the registry is upserted.

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::args::WebhookArgs;
use super::config::QueueConfig;
use super::hooks::{ApiAuth, HookApi, HookSpec};
use super::store::{JobStore, RegistryRecord, RegistryStatus, StoreError};
use crate::types::ConnectorId;

pub const WEBHOOK_NAME: &str = "Review Relay Webhook";
pub const WEBHOOK_EVENTS: [&str; 2] = ["merge_requests", "notes"];

#[derive(Debug, Error)]
pub enum JobError {
    #[error("public endpoint is not configured")]
    MissingPublicEndpoint,

    #[error("{provider} API call {op} failed: {message}")]
    Api {
        provider: String,
        op: &'static str,
        message: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("job timed out after {0:?}")]
    TimedOut(std::time::Duration),
}

fn api_error<'a, E: std::fmt::Display>(
    args: &'a WebhookArgs,
    op: &'static str,
) -> impl FnOnce(E) -> JobError + 'a {
    move |e| JobError::Api {
        provider: args.provider.clone(),
        op,
        message: e.to_string(),
    }
}

/// Collapses provider aliases (`gitlab-com`, `github-enterprise`, ...) to
/// the name used in webhook routes.
pub fn canonical_provider(provider: &str) -> Option<&'static str> {
    match provider.to_ascii_lowercase().as_str() {
        "gitlab" | "gitlab-com" | "gitlab-enterprise" => Some("gitlab"),
        "github" | "github-com" | "github-enterprise" => Some("github"),
        "bitbucket" | "bitbucket-cloud" => Some("bitbucket"),
        "gitea" => Some("gitea"),
        _ => None,
    }
}

fn public_base(config: &QueueConfig) -> Result<&str, JobError> {
    let base = config.public_endpoint.trim().trim_end_matches('/');
    if base.is_empty() {
        return Err(JobError::MissingPublicEndpoint);
    }
    Ok(base)
}

/// Connector-scoped delivery URL:
/// `<base>/api/v1/<provider>-hook/<connector_id>`, or
/// `<base>/api/v1/webhook/<connector_id>` for unknown providers.
pub fn endpoint_url(
    public_base: &str,
    provider: &str,
    connector_id: &ConnectorId,
) -> String {
    let base = public_base.trim_end_matches('/');
    match canonical_provider(provider) {
        Some(name) => format!("{base}/api/v1/{name}-hook/{connector_id}"),
        None => format!("{base}/api/v1/webhook/{connector_id}"),
    }
}

/// Pre-connector URL (`<base>/api/v1/<provider>-hook`), still matched on
/// removal so hooks installed by older deployments are cleaned up.
pub fn legacy_endpoint_url(public_base: &str, provider: &str) -> String {
    let base = public_base.trim_end_matches('/');
    let name = canonical_provider(provider).unwrap_or(provider);
    format!("{base}/api/v1/{name}-hook")
}

/// Numeric ids pass through; paths are resolved by the provider.
async fn resolve_project<H: HookApi>(api: &H, args: &WebhookArgs) -> Result<String, JobError> {
    let path = args.project_path.trim();
    if !path.is_empty() && path.chars().all(|c| c.is_ascii_digit()) {
        return Ok(path.to_string());
    }
    let id = api
        .resolve_project_id(ApiAuth::from(args), path)
        .await
        .map_err(api_error(args, "resolve project"))?;
    debug!(project = %args.project_path, project_id = %id, "Resolved project id");
    Ok(id)
}

fn registry_status(provider: &str) -> RegistryStatus {
    if canonical_provider(provider) == Some("gitlab") {
        RegistryStatus::Automatic
    } else {
        RegistryStatus::Manual
    }
}

/// Installs (or refreshes) the webhook for one project and records it.
pub async fn install_webhook<H: HookApi>(
    api: &H,
    store: &JobStore,
    config: &QueueConfig,
    args: &WebhookArgs,
) -> Result<RegistryRecord, JobError> {
    let url = endpoint_url(public_base(config)?, &args.provider, &args.connector_id);
    let auth = ApiAuth::from(args);
    let project_id = resolve_project(api, args).await?;

    let spec = HookSpec {
        url: url.clone(),
        secret: config.webhook_secret.clone(),
        events: WEBHOOK_EVENTS.iter().map(|e| e.to_string()).collect(),
    };

    let existing = api
        .list_hooks(auth, &project_id)
        .await
        .map_err(api_error(args, "list hooks"))?
        .into_iter()
        .find(|h| h.url == url);

    let hook = match existing {
        Some(hook) => {
            info!(project_id = %project_id, hook_id = %hook.id, "Webhook already installed, updating");
            api.update_hook(auth, &project_id, &hook.id, &spec)
                .await
                .map_err(api_error(args, "update hook"))?
        }
        None => {
            let hook = api
                .create_hook(auth, &project_id, &spec)
                .await
                .map_err(api_error(args, "create hook"))?;
            info!(project_id = %project_id, hook_id = %hook.id, url = %url, "Webhook installed");
            hook
        }
    };

    let record = RegistryRecord {
        connector_id: args.connector_id.clone(),
        provider: args.provider.clone(),
        provider_project_id: project_id,
        project_name: args.project_name().to_string(),
        project_full_name: args.project_path.clone(),
        webhook_id: hook.id,
        webhook_url: hook.url,
        webhook_secret: config.webhook_secret.clone(),
        webhook_name: WEBHOOK_NAME.to_string(),
        events: WEBHOOK_EVENTS.join(","),
        status: registry_status(&args.provider),
        last_verified_at: Utc::now(),
    };
    let saved = record.clone();
    store
        .blocking(move |s| s.upsert_registry(&saved))
        .await?;
    Ok(record)
}

/// Deletes every hook pointing at this service and marks the project
/// unconnected.
pub async fn remove_webhook<H: HookApi>(
    api: &H,
    store: &JobStore,
    config: &QueueConfig,
    args: &WebhookArgs,
) -> Result<RegistryRecord, JobError> {
    let base = public_base(config)?;
    let targets = [
        endpoint_url(base, &args.provider, &args.connector_id),
        legacy_endpoint_url(base, &args.provider),
    ];
    let auth = ApiAuth::from(args);
    let project_id = resolve_project(api, args).await?;

    let hooks = api
        .list_hooks(auth, &project_id)
        .await
        .map_err(api_error(args, "list hooks"))?;

    let mut removed = 0;
    for hook in hooks.iter().filter(|h| targets.contains(&h.url)) {
        api.delete_hook(auth, &project_id, &hook.id)
            .await
            .map_err(api_error(args, "delete hook"))?;
        removed += 1;
    }
    if removed == 0 {
        warn!(project_id = %project_id, "No matching webhooks to remove");
    } else {
        info!(project_id = %project_id, removed, "Webhooks removed");
    }

    let record = RegistryRecord {
        connector_id: args.connector_id.clone(),
        provider: args.provider.clone(),
        provider_project_id: project_id,
        project_name: args.project_name().to_string(),
        project_full_name: args.project_path.clone(),
        webhook_id: String::new(),
        webhook_url: String::new(),
        webhook_secret: None,
        webhook_name: WEBHOOK_NAME.to_string(),
        events: WEBHOOK_EVENTS.join(","),
        status: RegistryStatus::Unconnected,
        last_verified_at: Utc::now(),
    };
    let saved = record.clone();
    store
        .blocking(move |s| s.upsert_registry(&saved))
        .await?;
    Ok(record)
}
