//! Request context construction.
//!
//! Gathers the transport request into the serializable context the oracle
//! prompt and the snippet's `ctx` binding both consume: method, path,
//! ordered path segments, query multimap, title-cased headers, parsed JSON
//! body, client address, session, and request id.

use adlib_error::ApiError;
use axum::http::{HeaderMap, Method};
use serde_json::{json, Map, Value};

/// The request context handed to the oracle and the snippet.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// HTTP method.
    pub method: String,
    /// Normalized path (leading slash, no trailing slash except root).
    pub path: String,
    /// Non-empty path segments, in order.
    pub segments: Vec<String>,
    /// Query parameters; each key keeps its ordered list of values.
    pub query: Vec<(String, Vec<String>)>,
    /// Title-cased header map.
    pub headers: Vec<(String, String)>,
    /// Parsed JSON body, when the request carried one.
    pub body_json: Value,
    /// Raw body as text, when it was valid UTF-8.
    pub body_raw: Option<String>,
    /// Client IP, when known.
    pub client_ip: Option<String>,
    /// Resolved session identifier.
    pub session_id: String,
    /// Request id (inbound `X-Request-ID` or freshly minted).
    pub request_id: String,
}

impl RequestContext {
    /// The JSON form seen by the oracle prompt and the `ctx` binding.
    pub fn to_value(&self) -> Value {
        let mut query = Map::new();
        for (key, values) in &self.query {
            query.insert(key.clone(), json!(values));
        }
        let mut headers = Map::new();
        for (key, value) in &self.headers {
            headers.insert(key.clone(), json!(value));
        }
        json!({
            "method": self.method,
            "path": self.path,
            "segments": self.segments,
            "query": Value::Object(query),
            "headers": Value::Object(headers),
            "body_json": self.body_json,
            "body_raw": self.body_raw,
            "client": {"ip": self.client_ip},
            "session": {"id": self.session_id},
            "request_id": self.request_id,
        })
    }
}

/// The inbound `X-Request-ID`, or a freshly minted one. Resolved once per
/// request so the context, the logs, and the response header all agree.
pub fn request_id_from(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

/// Build a [`RequestContext`] from transport parts.
///
/// Fails with [`ApiError::InvalidBody`] when a JSON content type carries an
/// unparseable body.
pub fn build_request_context(
    method: &Method,
    path: &str,
    raw_query: Option<&str>,
    headers: &HeaderMap,
    body: &[u8],
    client_ip: Option<String>,
    session_id: String,
    request_id: String,
) -> Result<RequestContext, ApiError> {
    let normalized_path = normalize_path(path);
    let segments: Vec<String> = normalized_path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    let query = parse_query(raw_query.unwrap_or(""));

    let mut header_list = Vec::with_capacity(headers.len());
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            header_list.push((title_case(name.as_str()), value.to_string()));
        }
    }

    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let body_json = if !body.is_empty() && content_type.to_lowercase().contains("application/json")
    {
        serde_json::from_slice(body).map_err(|_| ApiError::InvalidBody)?
    } else {
        Value::Null
    };
    let body_raw = if body.is_empty() {
        None
    } else {
        std::str::from_utf8(body).ok().map(str::to_string)
    };

    Ok(RequestContext {
        method: method.as_str().to_string(),
        path: normalized_path,
        segments,
        query,
        headers: header_list,
        body_json,
        body_raw,
        client_ip,
        session_id,
        request_id,
    })
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// Parse a query string into an ordered multimap.
fn parse_query(raw: &str) -> Vec<(String, Vec<String>)> {
    let mut out: Vec<(String, Vec<String>)> = Vec::new();
    for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
        let key = key.into_owned();
        let value = value.into_owned();
        match out.iter_mut().find(|(k, _)| *k == key) {
            Some((_, values)) => values.push(value),
            None => out.push((key, vec![value])),
        }
    }
    out
}

/// `content-type` → `Content-Type`.
fn title_case(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
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
    fn builds_segments_and_query_multimap() {
        let ctx = build_request_context(
            &Method::GET,
            "/members/search/",
            Some("name=Alice&tag=a&tag=b"),
            &headers(&[]),
            b"",
            Some("127.0.0.1".into()),
            "session-1".into(),
            "req-1".into(),
        )
        .unwrap();
        assert_eq!(ctx.path, "/members/search");
        assert_eq!(ctx.segments, vec!["members", "search"]);
        assert_eq!(
            ctx.query,
            vec![
                ("name".to_string(), vec!["Alice".to_string()]),
                ("tag".to_string(), vec!["a".to_string(), "b".to_string()]),
            ]
        );
    }

    #[test]
    fn parses_json_body_and_rejects_garbage() {
        let hdrs = headers(&[("content-type", "application/json")]);
        let ctx = build_request_context(
            &Method::POST,
            "/members",
            None,
            &hdrs,
            br#"{"name": "Alice"}"#,
            None,
            "s".into(),
            "req-1".into(),
        )
        .unwrap();
        assert_eq!(ctx.body_json, serde_json::json!({"name": "Alice"}));

        let err = build_request_context(
            &Method::POST,
            "/members",
            None,
            &hdrs,
            b"{not json",
            None,
            "s".into(),
            "req-1".into(),
        )
        .unwrap_err();
        assert!(matches!(err, ApiError::InvalidBody));
    }

    #[test]
    fn non_json_body_is_kept_raw() {
        let hdrs = headers(&[("content-type", "text/plain")]);
        let ctx = build_request_context(
            &Method::POST,
            "/notes",
            None,
            &hdrs,
            b"hello",
            None,
            "s".into(),
            "req-1".into(),
        )
        .unwrap();
        assert_eq!(ctx.body_json, serde_json::Value::Null);
        assert_eq!(ctx.body_raw.as_deref(), Some("hello"));
    }

    #[test]
    fn headers_are_title_cased() {
        let hdrs = headers(&[("x-session-id", "abc"), ("content-type", "text/plain")]);
        let ctx = build_request_context(
            &Method::GET,
            "/",
            None,
            &hdrs,
            b"",
            None,
            "s".into(),
            "req-1".into(),
        )
        .unwrap();
        assert!(ctx.headers.iter().any(|(k, _)| k == "X-Session-Id"));
        assert!(ctx.headers.iter().any(|(k, _)| k == "Content-Type"));
    }

    #[test]
    fn request_id_is_taken_from_header_or_minted() {
        let hdrs = headers(&[("x-request-id", "req-42")]);
        assert_eq!(request_id_from(&hdrs), "req-42");
        assert_eq!(request_id_from(&headers(&[])).len(), 36);
    }
}
