//! Execution harness: validates a plan's snippet and runs it to a [`Reply`].
//!
//! Each execution gets a fresh interpreter; no state leaks between calls.
//! The interpreter is synchronous and checks its own deadline on every
//! statement, so it runs on the blocking thread pool with an async timeout
//! as a backstop. The public API is fully async and `Send`-safe.

use std::sync::Arc;
use std::time::{Duration, Instant};

use adlib_store::CollectionStore;
use serde_json::Value as Json;
use tokio::sync::Semaphore;

use crate::audit::{AuditEntryBuilder, AuditLogger, NoopAuditLogger};
use crate::error::SandboxError;
use crate::interp::{ExecError, Interp};
use crate::plan::Plan;
use crate::value::Value;
use crate::{ast_check, validator};

/// The structured HTTP outcome produced by a snippet. Transient; the
/// transport layer serializes it into a protocol response.
#[derive(Debug, Clone)]
pub struct Reply {
    /// HTTP status code.
    pub status: u16,
    /// Response body; `None` maps to an empty payload.
    pub body: Option<Json>,
    /// Response headers, in the order the snippet set them.
    pub headers: Vec<(String, String)>,
    /// Whether the body should be serialized as JSON.
    pub is_json: bool,
}

/// Configuration for the execution harness.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Maximum wall-clock execution time for a snippet.
    pub timeout: Duration,
    /// Maximum size of oracle-generated code in bytes.
    pub max_code_size: usize,
    /// Maximum serialized size of the reply body in bytes.
    pub max_result_bytes: usize,
    /// Maximum length of diagnostic messages carried out of a failure.
    pub max_log_bytes: usize,
    /// Maximum concurrent snippet executions.
    pub max_concurrent: usize,
    /// Total loop/comprehension iteration budget per execution.
    pub max_loop_iterations: u64,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(8),
            max_code_size: 64 * 1024,
            max_result_bytes: 32 * 1024,
            max_log_bytes: 4 * 1024,
            max_concurrent: 8,
            max_loop_iterations: 100_000,
        }
    }
}

/// The execution harness. Validates snippets and runs them bounded.
pub struct Harness {
    config: HarnessConfig,
    semaphore: Arc<Semaphore>,
    audit_logger: Arc<dyn AuditLogger>,
}

impl Harness {
    /// Create a harness with the given configuration.
    pub fn new(config: HarnessConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            config,
            semaphore,
            audit_logger: Arc::new(NoopAuditLogger),
        }
    }

    /// Create a harness with an audit logger.
    pub fn with_audit_logger(config: HarnessConfig, logger: Arc<dyn AuditLogger>) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            config,
            semaphore,
            audit_logger: logger,
        }
    }

    /// The active configuration.
    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Validate the plan's snippet and execute it against the given
    /// tenant+collection store, producing a [`Reply`].
    ///
    /// `ctx` is the request context the snippet sees under its `ctx` binding.
    pub async fn execute(
        &self,
        plan: &Plan,
        ctx: &Json,
        store: CollectionStore,
    ) -> Result<Reply, SandboxError> {
        tracing::info!(
            code_len = plan.code.len(),
            action = plan.action.as_str(),
            resource = %plan.resource,
            "execute: starting"
        );

        let audit = AuditEntryBuilder::new(&plan.code, plan.action, &plan.resource);

        let result = self.execute_inner(plan, ctx, store).await;

        let entry = audit.finish(&result);
        self.audit_logger.log(&entry).await;

        match &result {
            Ok(reply) => tracing::info!(status = reply.status, "execute: complete"),
            Err(e) => tracing::warn!(error = %e, "execute: failed"),
        }

        result
    }

    async fn execute_inner(
        &self,
        plan: &Plan,
        ctx: &Json,
        store: CollectionStore,
    ) -> Result<Reply, SandboxError> {
        validator::validate_source(&plan.code, self.config.max_code_size)?;
        let body = ast_check::validate(&plan.code)?;

        let _permit = self.semaphore.clone().try_acquire_owned().map_err(|_| {
            SandboxError::ConcurrencyLimit {
                max: self.config.max_concurrent,
            }
        })?;

        let config = self.config.clone();
        let ctx = ctx.clone();
        let plan_value = plan.to_value();

        let handle =
            tokio::task::spawn_blocking(move || run_snippet(&config, &body, &ctx, &plan_value, &store));

        // The interpreter enforces its own deadline; this timeout is the
        // backstop for a blocking thread wedged below it.
        let grace = self.config.timeout + Duration::from_millis(500);
        match tokio::time::timeout(grace, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(SandboxError::Internal {
                message: format!("execution thread panicked: {join_error}"),
            }),
            Err(_) => Err(SandboxError::Timeout {
                timeout_ms: self.config.timeout.as_millis() as u64,
            }),
        }
    }
}

/// Run a validated snippet to completion and extract its reply.
fn run_snippet(
    config: &HarnessConfig,
    body: &[rustpython_parser::ast::Stmt],
    ctx: &Json,
    plan_value: &Json,
    store: &CollectionStore,
) -> Result<Reply, SandboxError> {
    let deadline = Instant::now() + config.timeout;
    let mut interp = Interp::new(store, ctx, plan_value, deadline, config.max_loop_iterations);

    if let Err(e) = interp.run(body) {
        return Err(map_exec_error(config, e));
    }

    let Some(reply) = interp.take_reply() else {
        return Err(SandboxError::MissingReply {
            reason: "snippet did not bind REPLY".into(),
        });
    };
    extract_reply(config, reply)
}

fn map_exec_error(config: &HarnessConfig, error: ExecError) -> SandboxError {
    match error {
        ExecError::Timeout => SandboxError::Timeout {
            timeout_ms: config.timeout.as_millis() as u64,
        },
        ExecError::IterationBudget => SandboxError::IterationBudget {
            max: config.max_loop_iterations,
        },
        ExecError::Storage(e) => SandboxError::Storage(e),
        other => SandboxError::SnippetError {
            message: truncate(&other.render(), config.max_log_bytes),
        },
    }
}

/// Validate the shape of the bound reply value and convert it.
fn extract_reply(config: &HarnessConfig, reply: Value) -> Result<Reply, SandboxError> {
    let missing = |reason: &str| SandboxError::MissingReply {
        reason: reason.to_string(),
    };

    let Value::Dict(pairs) = reply else {
        return Err(missing("REPLY is not a mapping"));
    };

    let field = |name: &str| -> Option<Value> {
        pairs
            .iter()
            .find(|(k, _)| matches!(k, Value::Str(s) if s == name))
            .map(|(_, v)| v.clone())
    };

    let status = match field("status") {
        Some(Value::Int(i)) if (100..=599).contains(&i) => i as u16,
        Some(_) => return Err(missing("REPLY status is not a valid HTTP status")),
        None => return Err(missing("REPLY has no status")),
    };

    let body = match field("body") {
        None | Some(Value::None) => None,
        Some(value) => Some(value.to_json().map_err(|e| SandboxError::MissingReply {
            reason: format!("reply body is not serializable: {e}"),
        })?),
    };

    if let Some(body) = &body {
        let serialized_len = serde_json::to_vec(body).map(|v| v.len()).unwrap_or(0);
        if serialized_len > config.max_result_bytes {
            return Err(SandboxError::ResultTooLarge {
                max: config.max_result_bytes,
            });
        }
    }

    let headers = match field("headers") {
        None | Some(Value::None) => Vec::new(),
        Some(Value::Dict(header_pairs)) => {
            let mut out = Vec::with_capacity(header_pairs.len());
            for (key, value) in header_pairs {
                let Value::Str(key) = key else {
                    return Err(missing("header names must be strings"));
                };
                out.push((key, value.py_str()));
            }
            out
        }
        Some(_) => return Err(missing("REPLY headers is not a mapping")),
    };

    let is_json = match field("is_json") {
        None => true,
        Some(value) => value.truthy(),
    };

    Ok(Reply {
        status,
        body,
        headers,
        is_json,
    })
}

fn truncate(message: &str, max: usize) -> String {
    if message.len() <= max {
        return message.to_string();
    }
    let mut end = max;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = message[..end].to_string();
    out.push_str("...");
    out
}
