//! Inbound request authentication.
//!
//! Ghost signs webhook requests using HMAC-SHA256 and sends the result in
//! `X-Ghost-Signature` as `sha256=<hex>, t=<timestamp>`. Callers that are not
//! Ghost authenticate with a static token, either as `Authorization: Bearer
//! <token>` or as a `token` query parameter.

use axum::http::{header::AUTHORIZATION, HeaderMap};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{info, warn};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the Ghost webhook signature.
pub const GHOST_SIGNATURE_HEADER: &str = "x-ghost-signature";

/// Hash and timestamp parts of a Ghost signature header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GhostSignature<'a> {
    pub hash: &'a str,
    pub timestamp: &'a str,
}

/// Split a `sha256=<hex>, t=<timestamp>` header into its parts.
///
/// Returns `None` when either part is missing.
pub fn parse_ghost_signature(header: &str) -> Option<GhostSignature<'_>> {
    let mut hash = None;
    let mut timestamp = None;

    for part in header.split(',').map(str::trim) {
        if let Some(h) = part.strip_prefix("sha256=") {
            hash = Some(h);
        } else if let Some(t) = part.strip_prefix("t=") {
            timestamp = Some(t);
        }
    }

    Some(GhostSignature {
        hash: hash?,
        timestamp: timestamp?,
    })
}

/// Compute the hex HMAC-SHA256 Ghost expects: `HMAC(secret, body ++ timestamp)`.
pub fn compute_ghost_signature(secret: &str, body: &[u8], timestamp: &str) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    mac.update(timestamp.as_bytes());
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Verify a Ghost webhook signature header against the raw request body.
///
/// The timestamp is part of the signed payload but its age is not checked,
/// so a captured request stays valid indefinitely.
pub fn verify_ghost_signature(header: &str, body: &[u8], secret: &str) -> bool {
    let Some(signature) = parse_ghost_signature(header) else {
        warn!(
            has_hash = header.contains("sha256="),
            has_timestamp = header.contains("t="),
            "ghost_signature_malformed"
        );
        return false;
    };

    let Some(expected) = compute_ghost_signature(secret, body, signature.timestamp) else {
        warn!("ghost_signature_invalid_key");
        return false;
    };

    let valid = constant_time_compare(&expected, signature.hash);

    if !valid {
        warn!(
            body_length = body.len(),
            expected_length = expected.len(),
            actual_length = signature.hash.len(),
            "ghost_signature_mismatch"
        );
    }

    valid
}

/// Check the static token in the `Authorization` header or the `token` query parameter.
pub fn verify_token(headers: &HeaderMap, query_token: Option<&str>, secret: &str) -> bool {
    let header_token = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.strip_prefix("Bearer ").unwrap_or(v));

    let header_ok = header_token
        .map(|t| constant_time_compare(t, secret))
        .unwrap_or(false);
    let query_ok = query_token
        .map(|t| constant_time_compare(t, secret))
        .unwrap_or(false);

    header_ok || query_ok
}

/// Authenticate an inbound POST.
///
/// A present signature header selects signed-webhook mode exclusively;
/// otherwise the static token is checked.
pub fn verify_request(
    headers: &HeaderMap,
    query_token: Option<&str>,
    body: &[u8],
    secret: &str,
) -> bool {
    if let Some(header) = headers.get(GHOST_SIGNATURE_HEADER) {
        let valid = header
            .to_str()
            .map(|h| verify_ghost_signature(h, body, secret))
            .unwrap_or(false);
        info!(mode = "ghost_signature", valid, "request_auth_checked");
        return valid;
    }

    let valid = verify_token(headers, query_token, secret);
    info!(mode = "token", valid, "request_auth_checked");
    valid
}

/// Constant-time string comparison to prevent timing attacks.
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

/// Check if inbound authentication is enabled.
pub fn is_auth_enabled(secret: &Option<String>) -> bool {
    secret
        .as_ref()
        .map(|k| !k.trim().is_empty())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    const SECRET: &str = "ghost-shared-secret";
    const BODY: &[u8] = br#"{"member":{"current":{"email":"a@b.com"}}}"#;
    const TIMESTAMP: &str = "1712345678901";

    fn signed_header(body: &[u8], timestamp: &str) -> String {
        let hash = compute_ghost_signature(SECRET, body, timestamp).unwrap();
        format!("sha256={}, t={}", hash, timestamp)
    }

    #[test]
    fn test_parse_ghost_signature() {
        let parsed = parse_ghost_signature("sha256=abc123, t=99").unwrap();
        assert_eq!(parsed.hash, "abc123");
        assert_eq!(parsed.timestamp, "99");
    }

    #[test]
    fn test_parse_ghost_signature_missing_parts() {
        assert!(parse_ghost_signature("sha256=abc123").is_none());
        assert!(parse_ghost_signature("t=99").is_none());
        assert!(parse_ghost_signature("").is_none());
    }

    #[test]
    fn test_signature_is_hmac_of_body_then_timestamp() {
        let mut mac = HmacSha256::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(format!("{}{}", std::str::from_utf8(BODY).unwrap(), TIMESTAMP).as_bytes());
        let expected = hex::encode(mac.finalize().into_bytes());

        assert_eq!(compute_ghost_signature(SECRET, BODY, TIMESTAMP).unwrap(), expected);
    }

    #[test]
    fn test_verify_signature_valid() {
        let header = signed_header(BODY, TIMESTAMP);
        assert!(verify_ghost_signature(&header, BODY, SECRET));
    }

    #[test]
    fn test_verify_signature_wrong_secret() {
        let header = signed_header(BODY, TIMESTAMP);
        assert!(!verify_ghost_signature(&header, BODY, "other-secret"));
    }

    #[test]
    fn test_flipping_any_body_byte_invalidates() {
        let header = signed_header(BODY, TIMESTAMP);
        for i in 0..BODY.len() {
            let mut tampered = BODY.to_vec();
            tampered[i] ^= 0x01;
            assert!(!verify_ghost_signature(&header, &tampered, SECRET), "byte {i}");
        }
    }

    #[test]
    fn test_flipping_any_timestamp_byte_invalidates() {
        let hash = compute_ghost_signature(SECRET, BODY, TIMESTAMP).unwrap();
        for i in 0..TIMESTAMP.len() {
            let mut tampered = TIMESTAMP.as_bytes().to_vec();
            tampered[i] ^= 0x01;
            let tampered = String::from_utf8(tampered).unwrap();
            let header = format!("sha256={}, t={}", hash, tampered);
            assert!(!verify_ghost_signature(&header, BODY, SECRET), "byte {i}");
        }
    }

    #[test]
    fn test_uppercase_hash_rejected() {
        let hash = compute_ghost_signature(SECRET, BODY, TIMESTAMP).unwrap();
        let header = format!("sha256={}, t={}", hash.to_uppercase(), TIMESTAMP);
        assert!(!verify_ghost_signature(&header, BODY, SECRET));
    }

    #[test]
    fn test_verify_token_bearer_and_query() {
        let mut headers = HeaderMap::new();
        assert!(!verify_token(&headers, None, SECRET));
        assert!(verify_token(&headers, Some(SECRET), SECRET));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer ghost-shared-secret"));
        assert!(verify_token(&headers, None, SECRET));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer wrong"));
        assert!(!verify_token(&headers, Some("also-wrong"), SECRET));
    }

    #[test]
    fn test_verify_request_signature_mode_does_not_fall_back_to_token() {
        let mut headers = HeaderMap::new();
        headers.insert(
            GHOST_SIGNATURE_HEADER,
            HeaderValue::from_static("sha256=deadbeef, t=1"),
        );
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer ghost-shared-secret"));
        assert!(!verify_request(&headers, Some(SECRET), BODY, SECRET));
    }

    #[test]
    fn test_verify_request_signature_mode() {
        let mut headers = HeaderMap::new();
        headers.insert(
            GHOST_SIGNATURE_HEADER,
            HeaderValue::from_str(&signed_header(BODY, TIMESTAMP)).unwrap(),
        );
        assert!(verify_request(&headers, None, BODY, SECRET));
    }

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare("abc", "abc"));
        assert!(!constant_time_compare("abc", "abd"));
        assert!(!constant_time_compare("abc", "abcd"));
    }

    #[test]
    fn test_is_auth_enabled() {
        assert!(!is_auth_enabled(&None));
        assert!(!is_auth_enabled(&Some("".to_string())));
        assert!(!is_auth_enabled(&Some("   ".to_string())));
        assert!(is_auth_enabled(&Some("key123".to_string())));
    }
}
