//! Webhook signature primitives using HMAC-SHA256.
//!
//! GitHub and Bitbucket send `sha256=<hex>`, Gitea sends bare hex, and GitLab
//! sends the shared secret itself as a token. All comparisons go through the
//! HMAC library's constant-time `verify_slice`.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Parses a `sha256=<hex>` signature header into raw bytes.
///
/// Returns `None` for malformed headers (missing prefix, invalid hex).
pub fn parse_signature_header(header: &str) -> Option<Vec<u8>> {
    let hex_sig = header.trim().strip_prefix("sha256=")?;
    hex::decode(hex_sig).ok()
}

/// Computes the HMAC-SHA256 of a payload.
pub fn compute_signature(payload: &[u8], secret: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

/// Formats a signature as `sha256=<hex>`.
pub fn format_signature_header(signature: &[u8]) -> String {
    format!("sha256={}", hex::encode(signature))
}

/// Verifies raw signature bytes against the payload.
fn verify_bytes(payload: &[u8], expected: &[u8], secret: &[u8]) -> bool {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(expected).is_ok()
}

/// Verifies a `sha256=<hex>` header (GitHub, Bitbucket).
pub fn verify_prefixed_signature(payload: &[u8], signature_header: &str, secret: &[u8]) -> bool {
    match parse_signature_header(signature_header) {
        Some(sig) => verify_bytes(payload, &sig, secret),
        None => false,
    }
}

/// Verifies a bare hex signature (Gitea).
pub fn verify_hex_signature(payload: &[u8], hex_signature: &str, secret: &[u8]) -> bool {
    match hex::decode(hex_signature.trim()) {
        Ok(sig) => verify_bytes(payload, &sig, secret),
        Err(_) => false,
    }
}

/// Compares a shared-secret token in constant time (GitLab).
///
/// Both sides are hashed under the same key so the comparison length never
/// depends on the input.
pub fn verify_token(token: &str, secret: &[u8]) -> bool {
    let expected = compute_signature(secret, b"token-compare");
    verify_bytes(token.as_bytes(), &expected, b"token-compare")
}
