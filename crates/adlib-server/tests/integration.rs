//! End-to-end tests against the router with a deterministic scripted oracle.
//!
//! The scripted oracle reads the request context out of the prompt framing
//! and emits the same plan shapes and Python snippets a live planner does,
//! so these tests exercise the full pipeline: context → plan validation →
//! allowlist → interpreter → store → response.

use std::sync::Arc;

use adlib_sandbox::{Harness, HarnessConfig};
use adlib_server::oracle::{Oracle, OracleError, CONTEXT_MARKER};
use adlib_server::{router, AppState};
use adlib_store::SessionStore;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

/// Oracle that plans requests the way the production prompt asks a model to:
/// method + segments decide the action, and the snippet follows the house
/// conventions (201+Location, 404 envelope, 204 deletes, page envelopes).
struct ScriptedOracle;

fn context_from_prompt(prompt: &str) -> Value {
    let start = prompt.find(CONTEXT_MARKER).expect("prompt has context marker");
    let rest = &prompt[start + CONTEXT_MARKER.len()..];
    let end = rest.find("**Now output").expect("prompt has output marker");
    let json_start = rest[..end].find('{').expect("context is json");
    serde_json::from_str(rest[json_start..end].trim()).expect("context parses")
}

#[async_trait]
impl Oracle for ScriptedOracle {
    async fn plan_request(&self, prompt: &str) -> Result<String, OracleError> {
        let ctx = context_from_prompt(prompt);
        let method = ctx["method"].as_str().unwrap_or("GET");
        let segments: Vec<String> = ctx["segments"]
            .as_array()
            .map(|s| {
                s.iter()
                    .filter_map(|v| v.as_str())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let resource = segments.first().cloned().unwrap_or_else(|| "unknown".into());
        let is_search = segments.get(1).is_some_and(|s| s == "search");
        let identifier = match segments.get(1) {
            Some(s) if s != "search" => Value::String(s.clone()),
            _ => Value::Null,
        };

        let (action, code) = match (method, identifier.is_null(), is_search) {
            ("POST", true, _) => (
                "create",
                format!(
                    r#"body = ctx.get("body_json")
if not isinstance(body, dict):
    raise ValueError("Expected JSON object body")
record = store.insert(dict(body))
location = "/{resource}/" + str(record["id"])
headers = {{"Content-Type": "application/json", "Location": location}}
REPLY = make_response(201, record, headers=headers)"#
                ),
            ),
            ("GET", _, true) => (
                "search",
                r#"query = ctx.get("query") or {}
criteria = {}
for key, values in query.items():
    if not values:
        continue
    if key in {"limit", "offset", "sort"}:
        continue
    criteria[key] = values[-1]

matches = list(store.search(criteria))
REPLY = make_response(200, matches)"#
                    .to_string(),
            ),
            ("GET", false, _) => (
                "get",
                r#"record = store.get(plan.get("identifier"))
if record is None:
    REPLY = make_response(404, {"error": "not found"})
else:
    REPLY = make_response(200, record)"#
                    .to_string(),
            ),
            ("GET", true, _) => (
                "list",
                r#"query = ctx.get("query") or {}
raw_limit = (query.get("limit") or [None])[0]
raw_offset = (query.get("offset") or [0])[0]
raw_sort = (query.get("sort") or [None])[0]

limit = int(raw_limit) if raw_limit not in (None, "") else None
offset = int(raw_offset) if raw_offset not in (None, "") else 0

items, total = store.list(limit=limit, offset=offset, sort=raw_sort)
page = {
    "limit": limit if limit is not None else len(items),
    "offset": offset,
    "total": total,
}
REPLY = make_response(200, {"items": items, "page": page})"#
                    .to_string(),
            ),
            ("DELETE", false, _) => (
                "delete",
                r#"deleted = store.delete(plan.get("identifier"))
if not deleted:
    REPLY = make_response(404, {"error": "not found"})
else:
    REPLY = make_response(204, None, headers={}, is_json=False)"#
                    .to_string(),
            ),
            ("PUT", false, _) => (
                "replace",
                r#"body = ctx.get("body_json")
if not isinstance(body, dict):
    raise ValueError("Expected JSON object body")
record = store.replace(plan.get("identifier"), dict(body))
if record is None:
    REPLY = make_response(404, {"error": "not found"})
else:
    REPLY = make_response(200, record)"#
                    .to_string(),
            ),
            ("PATCH", false, _) => (
                "patch",
                r#"body = ctx.get("body_json")
if not isinstance(body, dict):
    raise ValueError("Expected JSON object body")
record = store.update(plan.get("identifier"), dict(body))
if record is None:
    REPLY = make_response(404, {"error": "not found"})
else:
    REPLY = make_response(200, record)"#
                    .to_string(),
            ),
            _ => (
                "get",
                r#"REPLY = make_response(400, {"error": "unsupported"})"#.to_string(),
            ),
        };

        let plan = json!({
            "action": action,
            "resource": resource,
            "identifier": identifier,
            "criteria": {},
            "payload": ctx.get("body_json").cloned().unwrap_or(Value::Null),
            "code": {"language": "python", "block": format!("```python\n{code}\n```")},
        });
        Ok(serde_json::to_string_pretty(&plan).unwrap())
    }
}

/// Oracle that always returns a fixed blob, whatever the request.
struct FixedOracle(String);

#[async_trait]
impl Oracle for FixedOracle {
    async fn plan_request(&self, _prompt: &str) -> Result<String, OracleError> {
        Ok(self.0.clone())
    }
}

struct TestApp {
    _tmp: tempfile::TempDir,
    app: Router,
}

fn app_with(oracle: Arc<dyn Oracle>, auth_token: Option<&str>) -> TestApp {
    let tmp = tempfile::tempdir().unwrap();
    let state = Arc::new(AppState {
        sessions: SessionStore::new(tmp.path()),
        harness: Harness::new(HarnessConfig::default()),
        oracle,
        auth_token: auth_token.map(str::to_string),
    });
    TestApp {
        _tmp: tmp,
        app: router(state),
    }
}

fn scripted_app() -> TestApp {
    app_with(Arc::new(ScriptedOracle), None)
}

async fn send(
    app: &Router,
    method: &str,
    path: &str,
    session: &str,
    body: Option<Value>,
) -> (StatusCode, axum::http::HeaderMap, Value) {
    let builder = Request::builder()
        .method(method)
        .uri(path)
        .header("x-session-id", session);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::String(
            String::from_utf8_lossy(&bytes).to_string(),
        ))
    };
    (status, headers, json)
}

#[tokio::test]
async fn create_get_delete_flow() {
    let test = scripted_app();
    let session = "session-create";

    let (status, headers, body) = send(
        &test.app,
        "POST",
        "/members",
        session,
        Some(json!({"name": "Alice"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(headers.get("location").unwrap(), "/members/1");
    assert_eq!(body, json!({"name": "Alice", "id": 1}));

    let (status, _, body) = send(&test.app, "GET", "/members/1", session, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"name": "Alice", "id": 1}));

    let (status, _, body) = send(&test.app, "DELETE", "/members/1", session, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(body, Value::Null);

    let (status, _, body) = send(&test.app, "GET", "/members/1", session, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, json!({"error": "not found"}));
}

#[tokio::test]
async fn list_paging_envelope() {
    let test = scripted_app();
    let session = "session-paging";
    for name in ["A", "B", "C", "D", "E"] {
        let (status, _, _) = send(
            &test.app,
            "POST",
            "/members",
            session,
            Some(json!({"name": name})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let (status, _, body) = send(
        &test.app,
        "GET",
        "/members?limit=2&offset=2&sort=id",
        session,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["page"], json!({"limit": 2, "offset": 2, "total": 5}));
    let names: Vec<&str> = body["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|i| i["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["C", "D"]);
}

#[tokio::test]
async fn search_exact_and_contains() {
    let test = scripted_app();
    let session = "session-search";
    for name in ["Alice", "Hartmann", "Martha"] {
        send(
            &test.app,
            "POST",
            "/members",
            session,
            Some(json!({"name": name})),
        )
        .await;
    }

    let (status, _, body) = send(
        &test.app,
        "GET",
        "/members/search?name=Hartmann",
        session,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([{"name": "Hartmann", "id": 2}]));

    let (status, _, body) = send(
        &test.app,
        "GET",
        "/members/search?name__contains=art",
        session,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|i| i["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["Hartmann", "Martha"]);
}

#[tokio::test]
async fn sessions_are_isolated() {
    let test = scripted_app();

    let (status, _, body) = send(
        &test.app,
        "POST",
        "/items",
        "session-alpha",
        Some(json!({"name": "X"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["id"], json!(1));

    let (status, _, body) = send(
        &test.app,
        "POST",
        "/items",
        "session-beta",
        Some(json!({"name": "X"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["id"], json!(1), "each tenant has its own counter");

    // Each session reads back only its own record 1.
    let (status, _, body) = send(&test.app, "GET", "/items/1", "session-alpha", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"name": "X", "id": 1}));

    let (_, _, other_list) = send(&test.app, "GET", "/items", "session-beta", None).await;
    assert_eq!(other_list["page"]["total"], json!(1));

    // A third session sees nothing at all.
    let (_, _, fresh) = send(&test.app, "GET", "/items", "session-gamma", None).await;
    assert_eq!(fresh["items"], json!([]));
    assert_eq!(fresh["page"]["total"], json!(0));
}

#[tokio::test]
async fn replace_and_patch_flow() {
    let test = scripted_app();
    let session = "session-update";
    send(
        &test.app,
        "POST",
        "/products",
        session,
        Some(json!({"name": "Widget", "price": 10, "stock": 3})),
    )
    .await;

    let (status, _, body) = send(
        &test.app,
        "PATCH",
        "/products/1",
        session,
        Some(json!({"stock": 5})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({"id": 1, "name": "Widget", "price": 10, "stock": 5})
    );

    let (status, _, body) = send(
        &test.app,
        "PUT",
        "/products/1",
        session,
        Some(json!({"name": "Widget v2"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"id": 1, "name": "Widget v2"}));

    let (status, _, _) = send(
        &test.app,
        "PATCH",
        "/products/999",
        session,
        Some(json!({"stock": 0})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn auth_gates_requests_when_configured() {
    let test = app_with(Arc::new(ScriptedOracle), Some("s3cret"));

    let request = Request::builder()
        .method("GET")
        .uri("/members")
        .header("x-session-id", "session-secure")
        .body(Body::empty())
        .unwrap();
    let response = test.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .method("GET")
        .uri("/members")
        .header("x-session-id", "session-secure")
        .header("authorization", "Bearer s3cret")
        .body(Body::empty())
        .unwrap();
    let response = test.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["items"], json!([]));
}

#[tokio::test]
async fn unparseable_oracle_output_is_a_malformed_plan() {
    let test = app_with(
        Arc::new(FixedOracle("I would suggest a GET request.".into())),
        None,
    );
    let (status, _, body) = send(&test.app, "GET", "/members", "session-x", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], json!("malformed_plan"));
}

#[tokio::test]
async fn unsafe_plan_code_is_rejected_with_a_reason() {
    let plan = json!({
        "action": "list",
        "resource": "members",
        "code": "import os\nREPLY = make_response(200, os.listdir('/'))",
    });
    let test = app_with(Arc::new(FixedOracle(plan.to_string())), None);
    let (status, _, body) = send(&test.app, "GET", "/members", "session-x", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], json!("unsafe_code"));
    assert!(body["detail"].as_str().unwrap().contains("import"));
}

#[tokio::test]
async fn snippet_timeout_maps_to_execution_timeout() {
    let plan = json!({
        "action": "list",
        "resource": "members",
        "code": "while True:\n    x = 1",
    });
    let tmp = tempfile::tempdir().unwrap();
    let state = Arc::new(AppState {
        sessions: SessionStore::new(tmp.path()),
        harness: Harness::new(HarnessConfig {
            timeout: std::time::Duration::from_millis(200),
            max_loop_iterations: u64::MAX,
            ..Default::default()
        }),
        oracle: Arc::new(FixedOracle(plan.to_string())),
        auth_token: None,
    });
    let app = router(state);
    let (status, _, body) = send(&app, "GET", "/members", "session-x", None).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], json!("execution_timeout"));
}

#[tokio::test]
async fn invalid_json_body_is_a_client_error() {
    let test = scripted_app();
    let request = Request::builder()
        .method("POST")
        .uri("/members")
        .header("x-session-id", "session-x")
        .header("content-type", "application/json")
        .body(Body::from("{broken"))
        .unwrap();
    let response = test.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn request_id_is_echoed_or_minted() {
    let test = scripted_app();
    let request = Request::builder()
        .method("GET")
        .uri("/members")
        .header("x-session-id", "session-x")
        .header("x-request-id", "req-42")
        .body(Body::empty())
        .unwrap();
    let response = test.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.headers().get("x-request-id").unwrap(), "req-42");

    let request = Request::builder()
        .method("GET")
        .uri("/members")
        .header("x-session-id", "session-x")
        .body(Body::empty())
        .unwrap();
    let response = test.app.clone().oneshot(request).await.unwrap();
    assert!(response.headers().contains_key("x-request-id"));
}

#[tokio::test]
async fn root_and_healthz_answer_without_the_oracle() {
    let test = app_with(
        Arc::new(FixedOracle("never called".into())),
        None,
    );
    let (status, _, body) = send(&test.app, "GET", "/healthz", "s", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "ok"}));

    let (status, _, body) = send(&test.app, "GET", "/", "s", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["message"].as_str().unwrap().contains("adlib"));
}

#[tokio::test]
async fn traversal_shaped_session_header_is_rejected() {
    let test = scripted_app();
    let request = Request::builder()
        .method("GET")
        .uri("/members")
        .header("x-session-id", "../../etc")
        .body(Body::empty())
        .unwrap();
    let response = test.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["error"], json!("invalid_session"));
}
