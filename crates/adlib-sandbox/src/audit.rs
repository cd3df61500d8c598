//! Audit logging for snippet executions.
//!
//! Every execution emits an [`AuditEntry`] containing:
//! - Execution ID (UUID)
//! - SHA-256 hash of the code (never raw code in logs)
//! - A redacted preview of the first 500 chars of code
//! - The plan's action and resource
//! - Duration and outcome
//!
//! The [`AuditLogger`] trait allows pluggable backends.
//! [`JsonLinesAuditLogger`] writes newline-delimited JSON to any `AsyncWrite`.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::executor::Reply;
use crate::error::SandboxError;
use crate::plan::Action;

/// Maximum length of the code preview in audit entries.
const CODE_PREVIEW_MAX: usize = 500;

/// A complete audit record for a single snippet execution.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    /// Unique execution identifier.
    pub execution_id: String,
    /// ISO-8601 timestamp of when execution started.
    pub timestamp: DateTime<Utc>,
    /// SHA-256 hash of the submitted code.
    pub code_hash: String,
    /// First N characters of the code, redacted (for human review).
    pub code_preview: String,
    /// The plan's declared action.
    pub action: &'static str,
    /// The plan's target collection.
    pub resource: String,
    /// Total execution duration in milliseconds.
    pub duration_ms: u64,
    /// Final outcome.
    pub outcome: AuditOutcome,
}

/// The outcome of a snippet execution.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum AuditOutcome {
    /// Execution produced a reply.
    Success {
        /// The reply's HTTP status.
        status: u16,
    },
    /// Execution was rejected or failed.
    Error {
        /// The (redacted) error message.
        message: String,
    },
    /// Execution was terminated on a time or iteration budget.
    Timeout,
}

/// Trait for audit log backends.
#[async_trait::async_trait]
pub trait AuditLogger: Send + Sync {
    /// Write an audit entry.
    async fn log(&self, entry: &AuditEntry);
}

/// Discards audit entries. Default when no backend is configured.
pub struct NoopAuditLogger;

#[async_trait::async_trait]
impl AuditLogger for NoopAuditLogger {
    async fn log(&self, _entry: &AuditEntry) {}
}

/// Emits audit entries as structured tracing events.
pub struct TracingAuditLogger;

#[async_trait::async_trait]
impl AuditLogger for TracingAuditLogger {
    async fn log(&self, entry: &AuditEntry) {
        tracing::info!(
            target: "adlib::audit",
            execution_id = %entry.execution_id,
            code_hash = %entry.code_hash,
            action = entry.action,
            resource = %entry.resource,
            duration_ms = entry.duration_ms,
            outcome = ?entry.outcome,
            "execution audited"
        );
    }
}

/// Writes audit entries as newline-delimited JSON to an `AsyncWrite` sink.
pub struct JsonLinesAuditLogger<W: AsyncWrite + Unpin + Send> {
    writer: Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> JsonLinesAuditLogger<W> {
    /// Create a new JSON lines audit logger writing to the given sink.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait::async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> AuditLogger for JsonLinesAuditLogger<W> {
    async fn log(&self, entry: &AuditEntry) {
        let mut line = match serde_json::to_string(entry) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize audit entry");
                return;
            }
        };
        line.push('\n');

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            tracing::warn!(error = %e, "failed to write audit entry");
        }
        let _ = writer.flush().await;
    }
}

/// Compute the SHA-256 hash of a string, returned as a hex string.
pub fn sha256_hex(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Create a code preview (first N bytes, with ellipsis if truncated).
///
/// Truncates at a valid UTF-8 char boundary to avoid panics on multibyte
/// characters.
fn code_preview(code: &str) -> String {
    if code.len() <= CODE_PREVIEW_MAX {
        return code.to_string();
    }
    let mut end = CODE_PREVIEW_MAX;
    while !code.is_char_boundary(end) {
        end -= 1;
    }
    let mut preview = code[..end].to_string();
    preview.push_str("...");
    preview
}

/// Builder for constructing audit entries around an execution.
pub struct AuditEntryBuilder {
    execution_id: String,
    timestamp: DateTime<Utc>,
    code_hash: String,
    code_preview: String,
    action: Action,
    resource: String,
    start: Instant,
}

impl AuditEntryBuilder {
    /// Start building an audit entry for an execution.
    pub fn new(code: &str, action: Action, resource: &str) -> Self {
        Self {
            execution_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            code_hash: sha256_hex(code),
            code_preview: crate::redact::redact_error_message(&code_preview(code)),
            action,
            resource: resource.to_string(),
            start: Instant::now(),
        }
    }

    /// Finish the entry with the execution's result.
    pub fn finish(self, result: &Result<Reply, SandboxError>) -> AuditEntry {
        let outcome = match result {
            Ok(reply) => AuditOutcome::Success {
                status: reply.status,
            },
            Err(SandboxError::Timeout { .. }) | Err(SandboxError::IterationBudget { .. }) => {
                AuditOutcome::Timeout
            }
            Err(e) => AuditOutcome::Error {
                message: crate::redact::redact_error_message(&e.to_string()),
            },
        };
        AuditEntry {
            execution_id: self.execution_id,
            timestamp: self.timestamp,
            code_hash: self.code_hash,
            code_preview: self.code_preview,
            action: self.action.as_str(),
            resource: self.resource,
            duration_ms: self.start.elapsed().as_millis() as u64,
            outcome,
        }
    }
}

/// Collects entries in memory; test helper.
pub struct MemoryAuditLogger {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditLogger {
    /// Create an empty collector.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(Vec::new()),
        })
    }

    /// Snapshot the collected entries.
    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl AuditLogger for MemoryAuditLogger {
    async fn log(&self, entry: &AuditEntry) {
        self.entries.lock().await.push(entry.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_hex() {
        let h = sha256_hex("REPLY = make_response(200)");
        assert_eq!(h.len(), 64);
        assert_eq!(h, sha256_hex("REPLY = make_response(200)"));
        assert_ne!(h, sha256_hex("REPLY = make_response(201)"));
    }

    #[test]
    fn preview_truncates_long_code() {
        let code = "x = 1\n".repeat(200);
        let preview = code_preview(&code);
        assert!(preview.len() <= CODE_PREVIEW_MAX + 3);
        assert!(preview.ends_with("..."));
    }

    #[tokio::test]
    async fn jsonl_logger_writes_one_line_per_entry() {
        let buffer: Vec<u8> = Vec::new();
        let logger = JsonLinesAuditLogger::new(buffer);
        let builder = AuditEntryBuilder::new("x = 1", Action::Get, "members");
        let entry = builder.finish(&Err(SandboxError::MissingReply {
            reason: "snippet did not bind REPLY".into(),
        }));
        logger.log(&entry).await;

        let buffer = logger.writer.lock().await;
        let text = String::from_utf8(buffer.clone()).unwrap();
        assert_eq!(text.lines().count(), 1);
        let parsed: serde_json::Value = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(parsed["action"], "get");
        assert_eq!(parsed["resource"], "members");
        assert_eq!(parsed["code_hash"].as_str().unwrap().len(), 64);
    }

    #[test]
    fn budget_exhaustion_audits_as_timeout() {
        let builder = AuditEntryBuilder::new("x = 1", Action::List, "members");
        let entry = builder.finish(&Err(SandboxError::IterationBudget { max: 100 }));
        assert!(matches!(entry.outcome, AuditOutcome::Timeout));
    }
}
