#![warn(missing_docs)]

//! # adlib-server
//!
//! HTTP transport for the adlib metaservice.
//!
//! One catch-all route accepts every method and path. Each request is turned
//! into a [`context::RequestContext`], sent to the planning oracle, and the
//! returned plan is validated and executed by the sandbox harness against
//! the request session's store. The harness's [`Reply`] (or the typed error)
//! is serialized back as the HTTP response.

use std::net::SocketAddr;
use std::sync::Arc;

use adlib_error::ApiError;
use adlib_sandbox::error::SandboxError;
use adlib_sandbox::redact::redact_error_message;
use adlib_sandbox::{Harness, PlanError, Reply};
use adlib_store::{SessionStore, StoreError};
use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use tower_http::trace::TraceLayer;

pub mod context;
pub mod oracle;
pub mod session;

use context::build_request_context;
use oracle::{build_prompt, Oracle};

/// Shared server state.
pub struct AppState {
    /// Tenant namespace resolver.
    pub sessions: SessionStore,
    /// Snippet execution harness.
    pub harness: Harness,
    /// The planning oracle.
    pub oracle: Arc<dyn Oracle>,
    /// Bearer token required on every request; `None` disables auth.
    pub auth_token: Option<String>,
}

/// Build the service router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/healthz", get(healthz))
        .fallback(catch_all)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "message": "adlib: the ad-libbed REST service",
        "hint": "there are no endpoints; just start requesting some",
        "health": "/healthz",
    }))
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn catch_all(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    body: Bytes,
) -> Response {
    let client_ip = connect_info.map(|ConnectInfo(addr)| addr.ip().to_string());
    let request_id = context::request_id_from(&headers);

    match handle(&state, method, uri, headers, client_ip, &request_id, body).await {
        Ok(reply) => reply_response(reply, &request_id),
        Err(error) => error_response(&error, &request_id),
    }
}

async fn handle(
    state: &AppState,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    client_ip: Option<String>,
    request_id: &str,
    body: Bytes,
) -> Result<Reply, ApiError> {
    let token = session::require_auth(&headers, state.auth_token.as_deref())?;
    let session_id = session::derive_session_id(&headers, token.as_deref(), client_ip.as_deref());

    let ctx = build_request_context(
        &method,
        uri.path(),
        uri.query(),
        &headers,
        &body,
        client_ip,
        session_id.clone(),
        request_id.to_string(),
    )?;
    tracing::info!(
        request_id = %ctx.request_id,
        session_id = %session_id,
        method = %ctx.method,
        path = %ctx.path,
        "request received"
    );

    let tenant = state.sessions.resolve(&session_id).map_err(store_error)?;

    let ctx_value = ctx.to_value();
    let prompt = build_prompt(&ctx_value, &tenant.schemas());
    let raw_plan = state
        .oracle
        .plan_request(&prompt)
        .await
        .map_err(|e| ApiError::OracleFailure {
            message: redact_error_message(&e.to_string()),
        })?;

    let plan = adlib_sandbox::parse_plan(&raw_plan).map_err(plan_error)?;

    let store = tenant.collection(&plan.resource).map_err(store_error)?;
    state
        .harness
        .execute(&plan, &ctx_value, store)
        .await
        .map_err(sandbox_error)
}

fn plan_error(error: PlanError) -> ApiError {
    ApiError::MalformedPlan {
        reason: error.to_string(),
    }
}

fn store_error(error: StoreError) -> ApiError {
    match error {
        StoreError::InvalidSession => ApiError::InvalidSession,
        StoreError::InvalidCollection => ApiError::MalformedPlan {
            reason: "plan resource is not a usable collection name".into(),
        },
        other => ApiError::StorageIo {
            message: redact_error_message(&other.to_string()),
        },
    }
}

fn sandbox_error(error: SandboxError) -> ApiError {
    match error {
        SandboxError::ValidationFailed { reason } => ApiError::UnsafeCode { construct: reason },
        SandboxError::CodeTooLarge { .. } | SandboxError::SyntaxError { .. } => {
            ApiError::UnsafeCode {
                construct: error.to_string(),
            }
        }
        SandboxError::UnsafeCode { construct } => ApiError::UnsafeCode { construct },
        SandboxError::Timeout { timeout_ms } => ApiError::ExecutionTimeout { timeout_ms },
        SandboxError::IterationBudget { max } => ApiError::ExecutionFailed {
            message: format!("loop iteration budget exhausted (max {max})"),
        },
        SandboxError::ResultTooLarge { max } => ApiError::ResultTooLarge { max },
        SandboxError::MissingReply { reason } => ApiError::MissingReply { reason },
        SandboxError::SnippetError { message } => ApiError::ExecutionFailed {
            message: redact_error_message(&message),
        },
        SandboxError::Storage(e) => store_error(e),
        SandboxError::ConcurrencyLimit { max } => ApiError::Overloaded { max },
        SandboxError::Internal { message } => ApiError::ExecutionFailed {
            message: redact_error_message(&message),
        },
    }
}

/// Serialize a snippet reply into the protocol response.
fn reply_response(reply: Reply, request_id: &str) -> Response {
    let status =
        StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let mut builder = Response::builder().status(status);
    let mut has_content_type = false;
    for (name, value) in &reply.headers {
        if name.eq_ignore_ascii_case("content-type") {
            has_content_type = true;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder = builder.header("x-request-id", request_id);

    let bytes: Vec<u8> = match (&reply.body, reply.is_json) {
        (None, _) => Vec::new(),
        (Some(body), true) => {
            if !has_content_type {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
            }
            serde_json::to_vec(body).unwrap_or_default()
        }
        (Some(body), false) => match body {
            serde_json::Value::String(s) => s.clone().into_bytes(),
            other => other.to_string().into_bytes(),
        },
    };

    builder
        .body(Body::from(bytes))
        .unwrap_or_else(|_| plain_error_response(StatusCode::INTERNAL_SERVER_ERROR, request_id))
}

/// Serialize a typed error into the protocol response.
fn error_response(error: &ApiError, request_id: &str) -> Response {
    let status =
        StatusCode::from_u16(error.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = serde_json::to_vec(&error.to_body()).unwrap_or_default();
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-request-id", request_id)
        .body(Body::from(body))
        .unwrap_or_else(|_| plain_error_response(status, request_id))
}

/// Last-resort response when header values refuse to serialize.
fn plain_error_response(status: StatusCode, request_id: &str) -> Response {
    let mut response = Response::new(Body::from(r#"{"error":"internal"}"#));
    *response.status_mut() = status;
    if let Ok(value) = request_id.parse() {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_errors_map_to_the_documented_codes() {
        let cases: Vec<(SandboxError, &str, u16)> = vec![
            (
                SandboxError::UnsafeCode {
                    construct: "import statement".into(),
                },
                "unsafe_code",
                400,
            ),
            (
                SandboxError::SyntaxError {
                    message: "bad".into(),
                },
                "unsafe_code",
                400,
            ),
            (
                SandboxError::Timeout { timeout_ms: 8000 },
                "execution_timeout",
                500,
            ),
            (
                SandboxError::ResultTooLarge { max: 32768 },
                "result_too_large",
                500,
            ),
            (
                SandboxError::MissingReply {
                    reason: "unbound".into(),
                },
                "missing_reply",
                500,
            ),
            (
                SandboxError::ConcurrencyLimit { max: 8 },
                "overloaded",
                503,
            ),
        ];
        for (sandbox, code, status) in cases {
            let api = sandbox_error(sandbox);
            assert_eq!(api.code(), code);
            assert_eq!(api.status(), status);
        }
    }

    #[test]
    fn store_errors_distinguish_client_and_server_faults() {
        assert_eq!(store_error(StoreError::InvalidSession).status(), 400);
        assert_eq!(store_error(StoreError::InvalidCollection).status(), 400);
        let io = StoreError::Io(std::io::Error::other("disk on fire at /var/lib/adlib"));
        let api = store_error(io);
        assert_eq!(api.status(), 500);
        assert_eq!(api.code(), "storage_io");
        assert!(!api.to_string().contains("/var/lib"), "paths must be redacted");
    }
}
