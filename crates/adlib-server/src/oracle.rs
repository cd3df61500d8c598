//! The planning oracle boundary.
//!
//! The oracle is a black box that turns a prompt into text expected to parse
//! as a plan. [`Oracle`] is the seam; [`HttpOracle`] speaks the OpenAI and
//! Anthropic chat APIs. Tests plug in deterministic implementations.

use adlib_config::OracleConfig;
use adlib_store::SchemaSnapshot;
use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;

/// Errors from the oracle boundary.
#[derive(Debug, Error)]
pub enum OracleError {
    /// Transport-level failure.
    #[error("oracle transport failure: {0}")]
    Http(#[from] reqwest::Error),

    /// The provider answered with an unusable payload.
    #[error("oracle returned an unusable response: {0}")]
    BadResponse(String),

    /// The provider API key environment variable is unset.
    #[error("missing API key: set {0}")]
    MissingKey(&'static str),
}

/// A planning oracle: prompt in, plan text out.
#[async_trait]
pub trait Oracle: Send + Sync {
    /// Produce the plan text for one request.
    async fn plan_request(&self, prompt: &str) -> Result<String, OracleError>;
}

/// Which provider API to speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    /// OpenAI chat completions.
    OpenAi,
    /// Anthropic messages.
    Anthropic,
}

/// HTTP-backed oracle for the supported providers.
#[derive(Debug)]
pub struct HttpOracle {
    client: reqwest::Client,
    provider: Provider,
    model: String,
    api_key: String,
}

impl HttpOracle {
    /// Build from config, reading the API key from the provider's standard
    /// environment variable.
    pub fn from_env(config: &OracleConfig) -> Result<Self, OracleError> {
        let provider = match config.provider.as_deref() {
            Some("anthropic") => Provider::Anthropic,
            _ => Provider::OpenAi,
        };
        let (key_var, default_model) = match provider {
            Provider::OpenAi => ("OPENAI_API_KEY", "gpt-4o-mini"),
            Provider::Anthropic => ("ANTHROPIC_API_KEY", "claude-3-5-sonnet-20241022"),
        };
        let api_key = std::env::var(key_var).map_err(|_| OracleError::MissingKey(key_var))?;
        Ok(Self {
            client: reqwest::Client::new(),
            provider,
            model: config
                .model
                .clone()
                .unwrap_or_else(|| default_model.to_string()),
            api_key,
        })
    }
}

#[async_trait]
impl Oracle for HttpOracle {
    async fn plan_request(&self, prompt: &str) -> Result<String, OracleError> {
        match self.provider {
            Provider::OpenAi => {
                let payload = json!({
                    "model": self.model,
                    "messages": [{"role": "user", "content": prompt}],
                    "max_tokens": 2048,
                });
                let response: Value = self
                    .client
                    .post("https://api.openai.com/v1/chat/completions")
                    .bearer_auth(&self.api_key)
                    .json(&payload)
                    .send()
                    .await?
                    .error_for_status()?
                    .json()
                    .await?;
                response["choices"][0]["message"]["content"]
                    .as_str()
                    .map(str::to_string)
                    .ok_or_else(|| OracleError::BadResponse("no completion content".into()))
            }
            Provider::Anthropic => {
                let payload = json!({
                    "model": self.model,
                    "max_tokens": 2048,
                    "messages": [{"role": "user", "content": prompt}],
                });
                let response: Value = self
                    .client
                    .post("https://api.anthropic.com/v1/messages")
                    .header("x-api-key", &self.api_key)
                    .header("anthropic-version", "2023-06-01")
                    .json(&payload)
                    .send()
                    .await?
                    .error_for_status()?
                    .json()
                    .await?;
                response["content"][0]["text"]
                    .as_str()
                    .map(str::to_string)
                    .ok_or_else(|| OracleError::BadResponse("no message content".into()))
            }
        }
    }
}

/// Markers framing the request context inside the prompt; kept stable so
/// scripted oracles and humans reading logs can find the payload.
pub const CONTEXT_MARKER: &str = "REQUEST CONTEXT:";
const OUTPUT_MARKER: &str = "**Now output the plan JSON and nothing else.**";

/// Build the planning prompt for one request.
pub fn build_prompt(ctx: &Value, schemas: &[(String, SchemaSnapshot)]) -> String {
    let mut known = String::new();
    if !schemas.is_empty() {
        known.push_str("Known collection shapes from earlier writes (reuse these field names):\n");
        for (name, snapshot) in schemas {
            known.push_str(&format!(
                "- {}: fields {:?}, example {}\n",
                name,
                snapshot.fields,
                serde_json::to_string(&snapshot.example).unwrap_or_default()
            ));
        }
        known.push('\n');
    }

    format!(
        r#"You are the request planner of a dynamic REST service. There are no
predefined endpoints; you decide what each request means and write the code
that services it.

Output one JSON object:
{{"action": "create|get|list|replace|patch|delete|search",
  "resource": "<collection name from the first path segment>",
  "identifier": <second path segment or null>,
  "criteria": {{}}, "payload": {{}},
  "code": {{"language": "python", "block": "<python snippet>"}}}}

Snippet rules:
- Only the names `store`, `ctx`, `plan`, and `make_response` are bound.
- `store` offers insert/get/replace/update/delete/list/search, scoped to the
  resource collection of this request's session.
- Finish by binding `REPLY = make_response(status, body, headers=..., is_json=...)`.
- No imports, no function or class definitions, no lambdas, no `with`, no
  bare `except:`; catch only ValueError/TypeError/KeyError/IndexError.
- Conventions: 201 with a Location header for creates, 404 with
  {{"error": "not found"}} for missing ids, 204 with no body for deletes,
  and {{"items": [...], "page": {{"limit", "offset", "total"}}}} for lists.

{known}{context_marker}
{context}

{output_marker}"#,
        known = known,
        context_marker = CONTEXT_MARKER,
        context = serde_json::to_string_pretty(ctx).unwrap_or_default(),
        output_marker = OUTPUT_MARKER,
    )
}
