//! Bearer authentication and session derivation.
//!
//! The session identifier is the tenant key: an explicit `X-Session-ID`
//! header wins; otherwise it is derived by hashing the bearer token, then
//! the client address, then a fixed anonymous seed. Hash-derived ids are
//! hex, so they always satisfy the store's path-component rules.

use adlib_error::ApiError;
use axum::http::HeaderMap;
use sha2::{Digest, Sha256};

/// Extract the bearer token from the `Authorization` header, if any.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() {
        Some(token.trim().to_string())
    } else {
        None
    }
}

/// Enforce bearer auth when a token is configured. Returns the presented
/// token for session derivation.
pub fn require_auth(
    headers: &HeaderMap,
    expected: Option<&str>,
) -> Result<Option<String>, ApiError> {
    let presented = bearer_token(headers);
    if let Some(expected) = expected {
        match &presented {
            Some(token) if token == expected => {}
            _ => return Err(ApiError::Unauthorized),
        }
    }
    Ok(presented)
}

/// Derive the session identifier for this request.
pub fn derive_session_id(
    headers: &HeaderMap,
    token: Option<&str>,
    client_ip: Option<&str>,
) -> String {
    if let Some(explicit) = headers.get("x-session-id").and_then(|v| v.to_str().ok()) {
        let explicit = explicit.trim();
        if !explicit.is_empty() {
            return explicit.to_string();
        }
    }
    let seed = token.or(client_ip).unwrap_or("anonymous");
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(
                axum::http::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                v.parse().unwrap(),
            );
        }
        map
    }

    #[test]
    fn auth_disabled_lets_everything_through() {
        assert!(require_auth(&headers(&[]), None).unwrap().is_none());
    }

    #[test]
    fn auth_enabled_requires_matching_bearer() {
        let expected = Some("s3cret");
        assert!(matches!(
            require_auth(&headers(&[]), expected),
            Err(ApiError::Unauthorized)
        ));
        assert!(matches!(
            require_auth(&headers(&[("authorization", "Bearer wrong")]), expected),
            Err(ApiError::Unauthorized)
        ));
        assert!(matches!(
            require_auth(&headers(&[("authorization", "Basic s3cret")]), expected),
            Err(ApiError::Unauthorized)
        ));
        let token = require_auth(&headers(&[("authorization", "Bearer s3cret")]), expected)
            .unwrap()
            .unwrap();
        assert_eq!(token, "s3cret");
    }

    #[test]
    fn explicit_session_header_wins() {
        let hdrs = headers(&[("x-session-id", "session-alpha")]);
        assert_eq!(
            derive_session_id(&hdrs, Some("tok"), Some("1.2.3.4")),
            "session-alpha"
        );
    }

    #[test]
    fn derived_sessions_are_stable_and_distinct() {
        let empty = headers(&[]);
        let from_token = derive_session_id(&empty, Some("tok-a"), Some("1.2.3.4"));
        assert_eq!(from_token, derive_session_id(&empty, Some("tok-a"), None));
        assert_ne!(from_token, derive_session_id(&empty, Some("tok-b"), None));

        let from_ip = derive_session_id(&empty, None, Some("1.2.3.4"));
        assert_ne!(from_token, from_ip);
        assert_eq!(from_ip.len(), 64);
        assert!(from_ip.bytes().all(|b| b.is_ascii_hexdigit()));
    }
}
