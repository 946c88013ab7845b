//! Webhook endpoint handlers.
//!
//! Every route funnels into [`receive_webhook`]: resolve the provider, check
//! the signature against the connector's secret, convert, capture, forward.
//! Deliveries the pipeline has no use for are acknowledged with 200 so the
//! forge does not redeliver them.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use super::{AppState, InboundEvent};
use crate::jobqueue::StoreError;
use crate::providers::{
    CaptureOutcome, ConvertError, SignatureCheck, WebhookProvider, check_signature,
    headers_to_map,
};
use crate::types::ConnectorId;

const CAPTURE_CATEGORY: &str = "webhook";

/// Errors that can occur when receiving a webhook.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("no provider recognizes this delivery")]
    UnknownProvider,

    #[error("{provider} delivery carries no event type")]
    MissingEventType { provider: &'static str },

    #[error("{provider} payload could not be converted: {source}")]
    MalformedPayload {
        provider: &'static str,
        source: ConvertError,
    },

    #[error("invalid {provider} signature")]
    InvalidSignature { provider: &'static str },

    #[error("secret lookup failed: {0}")]
    SecretLookup(#[from] StoreError),

    #[error("event consumer is unavailable")]
    ConsumerUnavailable { provider: &'static str },
}

impl WebhookError {
    fn code(&self) -> &'static str {
        match self {
            WebhookError::UnknownProvider => "unknown_provider",
            WebhookError::MissingEventType { .. } => "missing_event_type",
            WebhookError::MalformedPayload { .. } => "malformed_payload",
            WebhookError::InvalidSignature { .. } => "invalid_signature",
            WebhookError::SecretLookup(_) => "internal",
            WebhookError::ConsumerUnavailable { .. } => "unavailable",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            WebhookError::UnknownProvider
            | WebhookError::MissingEventType { .. }
            | WebhookError::MalformedPayload { .. } => StatusCode::BAD_REQUEST,
            WebhookError::InvalidSignature { .. } => StatusCode::UNAUTHORIZED,
            WebhookError::SecretLookup(_) => StatusCode::INTERNAL_SERVER_ERROR,
            WebhookError::ConsumerUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn provider(&self) -> Option<&'static str> {
        match self {
            WebhookError::MissingEventType { provider }
            | WebhookError::MalformedPayload { provider, .. }
            | WebhookError::InvalidSignature { provider }
            | WebhookError::ConsumerUnavailable { provider } => Some(*provider),
            WebhookError::UnknownProvider | WebhookError::SecretLookup(_) => None,
        }
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let mut body = json!({ "error": self.code() });
        if let Some(provider) = self.provider() {
            body["provider"] = provider.into();
        }
        if self.status() == StatusCode::BAD_REQUEST {
            body["message"] = self.to_string().into();
        }
        (self.status(), Json(body)).into_response()
    }
}

/// Response body for a delivery that was handled.
#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub status: &'static str,
    pub provider: &'static str,
    pub event_type: String,
}

/// `POST /webhook/{provider}/{connector_id}`. An unknown provider segment
/// falls back to detection.
pub async fn generic_webhook_handler(
    State(app_state): State<AppState>,
    Path((provider, connector_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, WebhookError> {
    receive(&app_state, Some(provider.as_str()), connector_id, headers, body).await
}

/// `POST /api/v1/webhook/{connector_id}`.
pub async fn detected_webhook_handler(
    State(app_state): State<AppState>,
    Path(connector_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, WebhookError> {
    receive(&app_state, None, connector_id, headers, body).await
}

/// Handles one delivery for `connector_id`, preferring the `provider` hint.
pub async fn receive_webhook(
    app_state: AppState,
    provider: Option<&'static str>,
    connector_id: String,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, WebhookError> {
    receive(&app_state, provider, connector_id, headers, body).await
}

async fn receive(
    app_state: &AppState,
    hint: Option<&str>,
    connector_id: String,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, WebhookError> {
    let connector_id = ConnectorId::new(connector_id);
    let capture = |namespace: &str, outcome: CaptureOutcome| {
        app_state.capture().record_detached(
            namespace.to_string(),
            CAPTURE_CATEGORY.to_string(),
            headers_to_map(&headers),
            body.to_vec(),
            outcome,
        );
    };

    let Some(provider) = app_state.registry().resolve(hint, &headers, &body) else {
        warn!(connector = %connector_id, hint = ?hint, "Unrecognized webhook delivery");
        capture(
            hint.unwrap_or("unknown"),
            CaptureOutcome::Rejected {
                reason: "unknown provider".into(),
            },
        );
        return Err(WebhookError::UnknownProvider);
    };
    let name = provider.name();

    let secret = webhook_secret(app_state, &connector_id, name).await?;
    let check = check_signature(provider, &headers, &body, secret.as_deref().map(str::as_bytes));
    if check == SignatureCheck::Invalid {
        warn!(connector = %connector_id, provider = name, "Rejecting webhook: invalid signature");
        capture(
            name,
            CaptureOutcome::Rejected {
                reason: "invalid signature".into(),
            },
        );
        return Err(WebhookError::InvalidSignature { provider: name });
    }

    let Some(event_type) = provider.event_type(&headers, &body) else {
        capture(
            name,
            CaptureOutcome::Rejected {
                reason: "missing event type".into(),
            },
        );
        return Err(WebhookError::MissingEventType { provider: name });
    };

    debug!(connector = %connector_id, provider = name, %event_type, ?check, "Received webhook");

    let event = match convert(provider, &event_type, &body) {
        Ok(Some(event)) => event,
        Ok(None) => {
            debug!(provider = name, %event_type, "Ignoring webhook");
            capture(
                name,
                CaptureOutcome::Ignored {
                    event_type: event_type.clone(),
                },
            );
            return Ok(Json(WebhookAck {
                status: "ignored",
                provider: name,
                event_type,
            }));
        }
        Err(e) => {
            warn!(provider = name, %event_type, error = %e, "Failed to convert webhook");
            capture(
                name,
                CaptureOutcome::Rejected {
                    reason: e.to_string(),
                },
            );
            return Err(WebhookError::MalformedPayload {
                provider: name,
                source: e,
            });
        }
    };

    capture(
        name,
        CaptureOutcome::Accepted {
            event_type: event_type.clone(),
            canonical: serde_json::to_value(&event).ok(),
        },
    );

    if let Some(events) = app_state.events() {
        let inbound = InboundEvent {
            connector_id: connector_id.clone(),
            event,
        };
        match events.try_send(inbound) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(connector = %connector_id, provider = name, "Event queue full");
                return Err(WebhookError::ConsumerUnavailable { provider: name });
            }
            Err(TrySendError::Closed(_)) => {
                warn!(connector = %connector_id, provider = name, "Event consumer has shut down");
                return Err(WebhookError::ConsumerUnavailable { provider: name });
            }
        }
    }

    info!(connector = %connector_id, provider = name, %event_type, "Accepted webhook");
    Ok(Json(WebhookAck {
        status: "accepted",
        provider: name,
        event_type,
    }))
}

/// Converts, treating a rejected payload (e.g. a deleted comment) as ignored.
fn convert(
    provider: &dyn WebhookProvider,
    event_type: &str,
    body: &[u8],
) -> Result<Option<crate::types::CanonicalEvent>, ConvertError> {
    match provider.convert(event_type, body) {
        Err(ConvertError::Rejected { reason, .. }) => {
            debug!(provider = provider.name(), event_type, reason, "Payload rejected");
            Ok(None)
        }
        other => other,
    }
}

/// The connector's secret, falling back to the process-wide default.
async fn webhook_secret(
    app_state: &AppState,
    connector_id: &ConnectorId,
    provider: &'static str,
) -> Result<Option<String>, StoreError> {
    let key = (connector_id.clone(), provider);
    let stored = match app_state.secret_cache().get(&key) {
        Some(cached) => cached,
        None => {
            let store = app_state.secrets().clone();
            let id = connector_id.clone();
            let loaded = tokio::task::spawn_blocking(move || store.webhook_secret(&id, provider))
                .await
                .map_err(|e| StoreError::Join(e.to_string()))??;
            app_state.secret_cache().insert(key, loaded.clone());
            loaded
        }
    };
    Ok(stored.or_else(|| app_state.default_secret().map(str::to_string)))
}
