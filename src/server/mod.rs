//! HTTP surface for inbound forge webhooks.
//!
//! # Endpoints
//!
//! - `POST /api/v1/{provider}-hook/{connector_id}` - per-provider receiver,
//!   the URL the job queue installs on forges
//! - `POST /api/v1/webhook/{connector_id}` - receiver that detects the provider
//! - `POST /webhook/{provider}/{connector_id}` - generic receiver
//! - `GET /health` - store and consumer status; 503 when degraded
//!
//! Accepted canonical events are forwarded to an mpsc consumer when one is
//! configured. The handler never waits on review work.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{MethodRouter, get, post};
use tokio::sync::mpsc;

use crate::cache::TtlCache;
use crate::config::SecretStore;
use crate::providers::{CaptureSink, ProviderRegistry};
use crate::types::{CanonicalEvent, ConnectorId};

pub mod health;
pub mod webhook;

pub use health::{HealthReport, health_handler};
pub use webhook::{WebhookError, receive_webhook};

/// Provider namespaces that get a dedicated `-hook` route.
pub const HOOK_PROVIDERS: [&str; 4] = ["gitlab", "github", "gitea", "bitbucket"];

const DEFAULT_SECRET_TTL: Duration = Duration::from_secs(300);

/// A converted delivery on its way to the review pipeline.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub connector_id: ConnectorId,
    pub event: CanonicalEvent,
}

type SecretKey = (ConnectorId, &'static str);

/// Shared application state, passed to handlers via `State`.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    registry: ProviderRegistry,
    secrets: Arc<dyn SecretStore>,
    /// Used when a connector has no secret of its own.
    default_secret: Option<String>,
    secret_cache: TtlCache<SecretKey, Option<String>>,
    capture: CaptureSink,
    events: Option<mpsc::Sender<InboundEvent>>,
}

impl AppState {
    pub fn builder(secrets: Arc<dyn SecretStore>) -> AppStateBuilder {
        AppStateBuilder {
            registry: ProviderRegistry::with_defaults(),
            secrets,
            default_secret: None,
            secret_cache: None,
            capture: CaptureSink::disabled(),
            events: None,
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.inner.registry
    }

    pub fn secrets(&self) -> &Arc<dyn SecretStore> {
        &self.inner.secrets
    }

    pub fn default_secret(&self) -> Option<&str> {
        self.inner.default_secret.as_deref()
    }

    pub fn capture(&self) -> &CaptureSink {
        &self.inner.capture
    }

    pub fn events(&self) -> Option<&mpsc::Sender<InboundEvent>> {
        self.inner.events.as_ref()
    }

    pub(crate) fn secret_cache(&self) -> &TtlCache<SecretKey, Option<String>> {
        &self.inner.secret_cache
    }

    /// Drops every cached secret, e.g. after a webhook was (re)installed.
    pub fn invalidate_secrets(&self) {
        self.inner.secret_cache.invalidate_all();
    }
}

pub struct AppStateBuilder {
    registry: ProviderRegistry,
    secrets: Arc<dyn SecretStore>,
    default_secret: Option<String>,
    secret_cache: Option<TtlCache<SecretKey, Option<String>>>,
    capture: CaptureSink,
    events: Option<mpsc::Sender<InboundEvent>>,
}

impl AppStateBuilder {
    pub fn registry(mut self, registry: ProviderRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn default_secret(mut self, secret: Option<String>) -> Self {
        self.default_secret = secret.filter(|s| !s.is_empty());
        self
    }

    pub fn secret_cache(mut self, cache: TtlCache<SecretKey, Option<String>>) -> Self {
        self.secret_cache = Some(cache);
        self
    }

    pub fn secret_ttl(self, ttl: Duration) -> Self {
        self.secret_cache(TtlCache::new(ttl))
    }

    pub fn capture(mut self, capture: CaptureSink) -> Self {
        self.capture = capture;
        self
    }

    pub fn events(mut self, events: mpsc::Sender<InboundEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> AppState {
        AppState {
            inner: Arc::new(AppStateInner {
                registry: self.registry,
                secrets: self.secrets,
                default_secret: self.default_secret,
                secret_cache: self
                    .secret_cache
                    .unwrap_or_else(|| TtlCache::new(DEFAULT_SECRET_TTL)),
                capture: self.capture,
                events: self.events,
            }),
        }
    }
}

/// Route for one provider's `-hook` endpoint; the provider is fixed by the path.
fn hook_route(provider: &'static str) -> MethodRouter<AppState> {
    post(
        move |state: axum::extract::State<AppState>,
              axum::extract::Path(connector_id): axum::extract::Path<String>,
              headers: axum::http::HeaderMap,
              body: axum::body::Bytes| async move {
            receive_webhook(state.0, Some(provider), connector_id, headers, body).await
        },
    )
}

/// Builds the axum Router with all endpoints.
pub fn build_router(app_state: AppState) -> axum::Router {
    let mut router = axum::Router::new();
    for provider in HOOK_PROVIDERS {
        router = router.route(
            &format!("/api/v1/{provider}-hook/{{connector_id}}"),
            hook_route(provider),
        );
    }
    router
        .route(
            "/api/v1/webhook/{connector_id}",
            post(webhook::detected_webhook_handler),
        )
        .route(
            "/webhook/{provider}/{connector_id}",
            post(webhook::generic_webhook_handler),
        )
        .route("/health", get(health_handler))
        .with_state(app_state)
}


#[cfg(test)]
mod integration_tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::config::StaticSecrets;
    use crate::providers::signature::{compute_signature, format_signature_header};

    fn issue_comment() -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "action": "created",
            "comment": {
                "id": 99,
                "body": "@bot please review",
                "user": {"id": 2, "login": "alice"},
                "created_at": "2024-03-01T10:00:00Z"
            },
            "issue": {
                "id": 500, "number": 7, "title": "Add widget",
                "pull_request": {"url": "https://api.github.com/..."}
            },
            "repository": {"id": 1, "name": "widgets", "full_name": "acme/widgets"},
            "sender": {"id": 2, "login": "alice"}
        }))
        .unwrap()
    }

    fn github_request(uri: &str, body: Vec<u8>, signature: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .header("x-github-event", "issue_comment");
        if let Some(secret) = signature {
            let header = format_signature_header(&compute_signature(&body, secret.as_bytes()));
            builder = builder.header("x-hub-signature-256", header);
        }
        builder.body(Body::from(body)).unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn state_with_secret(connector: &str, secret: &str) -> AppState {
        AppState::builder(Arc::new(StaticSecrets::new().with(connector, secret))).build()
    }

    // ─── Health endpoint tests ───

    #[tokio::test]
    async fn health_reports_store_and_consumer() {
        let (tx, _rx) = mpsc::channel(1);
        let state = AppState::builder(Arc::new(StaticSecrets::new()))
            .events(tx)
            .build();
        let app = build_router(state);

        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            json_body(response).await,
            serde_json::json!({"status": "ok", "store": "ok", "consumer": "ok"})
        );
    }

    // ─── Webhook endpoint tests ───

    #[tokio::test]
    async fn signed_delivery_is_accepted_and_forwarded() {
        let (tx, mut rx) = mpsc::channel(4);
        let state = AppState::builder(Arc::new(StaticSecrets::new().with("conn-1", "s3cret")))
            .events(tx)
            .build();
        let app = build_router(state);

        let request = github_request(
            "/api/v1/github-hook/conn-1",
            issue_comment(),
            Some("s3cret"),
        );
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "accepted");
        assert_eq!(body["provider"], "github");
        assert_eq!(body["event_type"], "issue_comment");

        let inbound = rx.recv().await.unwrap();
        assert_eq!(inbound.connector_id, ConnectorId::new("conn-1"));
        assert_eq!(inbound.event.comment().unwrap().id, "99");
    }

    #[tokio::test]
    async fn bad_signature_returns_401_with_provider() {
        let (tx, mut rx) = mpsc::channel(4);
        let state = AppState::builder(Arc::new(StaticSecrets::new().with("conn-1", "s3cret")))
            .events(tx)
            .build();
        let app = build_router(state);

        let request = github_request(
            "/api/v1/github-hook/conn-1",
            issue_comment(),
            Some("wrong"),
        );
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = json_body(response).await;
        assert_eq!(body["error"], "invalid_signature");
        assert_eq!(body["provider"], "github");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsigned_delivery_without_secret_is_accepted() {
        let app = build_router(AppState::builder(Arc::new(StaticSecrets::new())).build());

        let request = github_request("/webhook/github/conn-9", issue_comment(), None);
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "accepted");
    }

    #[tokio::test]
    async fn default_secret_applies_to_unknown_connectors() {
        let state = AppState::builder(Arc::new(StaticSecrets::new()))
            .default_secret(Some("fallback".into()))
            .build();
        let app = build_router(state);

        let request = github_request(
            "/api/v1/github-hook/conn-2",
            issue_comment(),
            Some("not-the-fallback"),
        );
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn provider_is_detected_on_the_generic_route() {
        let app = build_router(state_with_secret("conn-1", "s3cret"));

        let request = github_request("/api/v1/webhook/conn-1", issue_comment(), Some("s3cret"));
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["provider"], "github");
    }

    #[tokio::test]
    async fn undetectable_delivery_returns_400() {
        let app = build_router(AppState::builder(Arc::new(StaticSecrets::new())).build());

        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/webhook/conn-1")
            .body(Body::from("{}"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "unknown_provider");
    }

    #[tokio::test]
    async fn malformed_payload_returns_400() {
        let app = build_router(AppState::builder(Arc::new(StaticSecrets::new())).build());

        let request = github_request("/api/v1/github-hook/conn-1", b"not json".to_vec(), None);
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "malformed_payload");
    }

    #[tokio::test]
    async fn ignored_event_returns_200_without_forwarding() {
        let (tx, mut rx) = mpsc::channel(4);
        let state = AppState::builder(Arc::new(StaticSecrets::new()))
            .events(tx)
            .build();
        let app = build_router(state);

        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/github-hook/conn-1")
            .header("x-github-event", "ping")
            .body(Body::from(r#"{"zen":"hi"}"#))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "ignored");
        assert_eq!(body["event_type"], "ping");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn deliveries_are_captured() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::builder(Arc::new(StaticSecrets::new()))
            .capture(CaptureSink::new(dir.path()))
            .build();
        let app = build_router(state);

        let request = github_request("/api/v1/github-hook/conn-1", issue_comment(), None);
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // The capture write is detached; give the blocking pool a moment.
        let namespace = dir.path().join("github");
        for _ in 0..50 {
            if namespace.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(namespace.exists());
    }
}
