//! Forge webhook adapters.
//!
//! Each adapter recognizes its provider's deliveries, converts them into a
//! [`CanonicalEvent`], and optionally exposes signature validation through
//! [`WebhookProvider::signature_validator`].
//!
//! # Signature policy
//!
//! | secret configured | signature header | outcome                     |
//! |-------------------|------------------|-----------------------------|
//! | yes               | present          | strict check, reject on bad |
//! | yes               | absent           | accept with a warning       |
//! | no                | any              | accept                      |

use axum::http::HeaderMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::types::CanonicalEvent;

pub mod bitbucket;
pub mod capture;
pub mod gitea;
pub mod github;
pub mod gitlab;
pub mod outbound;
pub mod signature;

pub use bitbucket::BitbucketProvider;
pub use capture::{CaptureOutcome, CaptureSink};
pub use gitea::GiteaProvider;
pub use github::GitHubProvider;
pub use gitlab::GitLabProvider;
pub use outbound::{RecordingPoster, ReviewPoster};

/// Errors from converting a provider payload.
#[derive(Debug, Error)]
pub enum ConvertError {
    /// JSON deserialization failed (includes missing required fields).
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// The payload is well-formed but describes something that must not be
    /// processed (e.g. a deleted comment).
    #[error("rejected {event_type} payload: {reason}")]
    Rejected {
        event_type: String,
        reason: &'static str,
    },
}

/// Optional capability: verifying that a delivery came from the forge.
pub trait SignatureValidator: Send + Sync {
    /// Header carrying the signature or token.
    fn signature_header(&self) -> &'static str;

    /// Checks the header value against the raw body.
    fn verify(&self, signature: &str, body: &[u8], secret: &[u8]) -> bool;
}

/// A forge-specific webhook adapter.
pub trait WebhookProvider: Send + Sync {
    /// Provider namespace, used in routes, capture paths and canonical events.
    fn name(&self) -> &'static str;

    /// Whether this adapter recognizes the delivery.
    fn can_handle(&self, headers: &HeaderMap, body: &[u8]) -> bool;

    /// Extracts the provider's event type for a delivery.
    fn event_type(&self, headers: &HeaderMap, body: &[u8]) -> Option<String>;

    /// Maps a payload to a canonical event.
    ///
    /// Returns `Ok(None)` for event types and actions that are ignored.
    fn convert(&self, event_type: &str, body: &[u8])
    -> Result<Option<CanonicalEvent>, ConvertError>;

    /// Signature capability, if this provider supports one.
    fn signature_validator(&self) -> Option<&dyn SignatureValidator> {
        None
    }
}

/// Outcome of applying the signature policy to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureCheck {
    /// Secret configured and the signature matched.
    Verified,
    /// Secret configured but the delivery carried no signature.
    Unsigned,
    /// No secret configured, or the provider has no signature capability.
    NotRequired,
    /// Secret configured and the signature did not match.
    Invalid,
}

impl SignatureCheck {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, SignatureCheck::Invalid)
    }
}

/// Applies the signature policy for a delivery.
pub fn check_signature(
    provider: &dyn WebhookProvider,
    headers: &HeaderMap,
    body: &[u8],
    secret: Option<&[u8]>,
) -> SignatureCheck {
    let Some(secret) = secret.filter(|s| !s.is_empty()) else {
        return SignatureCheck::NotRequired;
    };
    let Some(validator) = provider.signature_validator() else {
        return SignatureCheck::NotRequired;
    };

    match header_str(headers, validator.signature_header()) {
        Some(sig) if !sig.is_empty() => {
            if validator.verify(sig, body, secret) {
                SignatureCheck::Verified
            } else {
                SignatureCheck::Invalid
            }
        }
        _ => {
            warn!(
                provider = provider.name(),
                header = validator.signature_header(),
                "Webhook secret configured but delivery is unsigned; accepting"
            );
            SignatureCheck::Unsigned
        }
    }
}

/// Ordered set of adapters.
pub struct ProviderRegistry {
    providers: Vec<Box<dyn WebhookProvider>>,
}

impl ProviderRegistry {
    pub fn new(providers: Vec<Box<dyn WebhookProvider>>) -> Self {
        ProviderRegistry { providers }
    }

    /// The four built-in adapters in detection order.
    pub fn with_defaults() -> Self {
        ProviderRegistry::new(vec![
            Box::new(GitLabProvider),
            Box::new(GitHubProvider),
            Box::new(GiteaProvider),
            Box::new(BitbucketProvider),
        ])
    }

    /// Looks up an adapter by its namespace.
    pub fn by_name(&self, name: &str) -> Option<&dyn WebhookProvider> {
        self.providers
            .iter()
            .find(|p| p.name() == name)
            .map(|p| p.as_ref())
    }

    /// Returns the first adapter that recognizes the delivery.
    pub fn detect(&self, headers: &HeaderMap, body: &[u8]) -> Option<&dyn WebhookProvider> {
        self.providers
            .iter()
            .find(|p| p.can_handle(headers, body))
            .map(|p| p.as_ref())
    }

    /// Uses the named adapter when given, falling back to detection.
    pub fn resolve(
        &self,
        hint: Option<&str>,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Option<&dyn WebhookProvider> {
        match hint.and_then(|name| self.by_name(name)) {
            Some(provider) => Some(provider),
            None => self.detect(headers, body),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.providers.iter().map(|p| p.name())
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        ProviderRegistry::with_defaults()
    }
}

/// Reads a header as UTF-8. `HeaderMap` lookups are case-insensitive.
pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Collects headers into a plain map for capture files.
pub fn headers_to_map(headers: &HeaderMap) -> std::collections::BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

/// Deserializes a raw forge payload with JSON `null` treated as an absent
/// key, so `#[serde(default)]` covers both. Forges send `null` freely for
/// optional strings such as avatars and descriptions.
pub(crate) fn parse_payload<T: DeserializeOwned>(body: &[u8]) -> Result<T, ConvertError> {
    let mut value: Value = serde_json::from_slice(body)?;
    strip_nulls(&mut value);
    Ok(serde_json::from_value(value)?)
}

fn strip_nulls(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.retain(|_, v| !v.is_null());
            map.values_mut().for_each(strip_nulls);
        }
        Value::Array(items) => items.iter_mut().for_each(strip_nulls),
        _ => {}
    }
}

/// Formats a numeric id the way the canonical model stores it.
pub(crate) fn id_string(id: u64) -> String {
    if id == 0 { String::new() } else { id.to_string() }
}

#[cfg(test)]
pub(crate) mod test_support {
    use axum::http::{HeaderMap, HeaderName, HeaderValue};

    pub fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::headers;
    use super::*;
    use crate::providers::signature::{compute_signature, format_signature_header};

    #[derive(Debug, Default, serde::Deserialize)]
    #[serde(default)]
    struct Nested {
        name: String,
        tags: Vec<String>,
        inner: Option<Box<Nested>>,
    }

    #[test]
    fn payload_nulls_fall_back_to_defaults() {
        let body = br#"{"name": null, "tags": null, "inner": {"name": "x", "tags": ["a"], "inner": null}}"#;
        let parsed: Nested = parse_payload(body).unwrap();
        assert_eq!(parsed.name, "");
        assert!(parsed.tags.is_empty());
        let inner = parsed.inner.unwrap();
        assert_eq!(inner.name, "x");
        assert_eq!(inner.tags, vec!["a"]);
        assert!(inner.inner.is_none());
    }

    #[test]
    fn payload_parse_errors_stay_json_errors() {
        let result: Result<Nested, _> = parse_payload(b"not json");
        assert!(matches!(result, Err(ConvertError::Json(_))));
    }

    #[test]
    fn detection_order_prefers_gitlab_headers() {
        let registry = ProviderRegistry::with_defaults();
        let h = headers(&[("X-Gitlab-Event", "Note Hook")]);
        assert_eq!(registry.detect(&h, b"{}").map(|p| p.name()), Some("gitlab"));
    }

    #[test]
    fn detection_falls_back_to_payload_shape() {
        let registry = ProviderRegistry::with_defaults();
        let body = br#"{"object_kind":"merge_request"}"#;
        assert_eq!(
            registry.detect(&HeaderMap::new(), body).map(|p| p.name()),
            Some("gitlab")
        );
    }

    #[test]
    fn detects_each_provider_by_headers() {
        let registry = ProviderRegistry::with_defaults();
        let cases = [
            (("X-GitHub-Event", "issue_comment"), "github"),
            (("X-Gitea-Event", "issue_comment"), "gitea"),
            (("X-Event-Key", "pullrequest:comment_created"), "bitbucket"),
        ];
        for ((name, value), expected) in cases {
            let h = headers(&[(name, value)]);
            assert_eq!(registry.detect(&h, b"{}").map(|p| p.name()), Some(expected));
        }
    }

    #[test]
    fn unknown_delivery_is_not_detected() {
        let registry = ProviderRegistry::with_defaults();
        assert!(registry.detect(&HeaderMap::new(), b"{}").is_none());
    }

    #[test]
    fn hint_overrides_detection() {
        let registry = ProviderRegistry::with_defaults();
        let h = headers(&[("X-GitHub-Event", "issue_comment")]);
        let provider = registry.resolve(Some("gitea"), &h, b"{}").unwrap();
        assert_eq!(provider.name(), "gitea");
    }

    #[test]
    fn signature_policy_matrix() {
        let body = br#"{"action":"created"}"#;
        let secret = b"hook-secret";
        let good = format_signature_header(&compute_signature(body, secret));
        let bad = format_signature_header(&compute_signature(body, b"other"));
        let provider = GitHubProvider;

        let signed = headers(&[("X-Hub-Signature-256", good.as_str())]);
        assert_eq!(
            check_signature(&provider, &signed, body, Some(secret)),
            SignatureCheck::Verified
        );

        let forged = headers(&[("X-Hub-Signature-256", bad.as_str())]);
        let check = check_signature(&provider, &forged, body, Some(secret));
        assert_eq!(check, SignatureCheck::Invalid);
        assert!(!check.is_accepted());

        assert_eq!(
            check_signature(&provider, &HeaderMap::new(), body, Some(secret)),
            SignatureCheck::Unsigned
        );
        assert_eq!(
            check_signature(&provider, &forged, body, None),
            SignatureCheck::NotRequired
        );
    }

    struct Unsigned;

    impl WebhookProvider for Unsigned {
        fn name(&self) -> &'static str {
            "plain"
        }
        fn can_handle(&self, _: &HeaderMap, _: &[u8]) -> bool {
            true
        }
        fn event_type(&self, _: &HeaderMap, _: &[u8]) -> Option<String> {
            None
        }
        fn convert(&self, _: &str, _: &[u8]) -> Result<Option<CanonicalEvent>, ConvertError> {
            Ok(None)
        }
    }

    #[test]
    fn provider_without_capability_is_not_checked() {
        let h = headers(&[("X-Hub-Signature-256", "sha256=00")]);
        assert_eq!(
            check_signature(&Unsigned, &h, b"{}", Some(b"secret")),
            SignatureCheck::NotRequired
        );
    }
}
