//! Error types for the adlib sandbox.

use adlib_store::StoreError;
use thiserror::Error;

/// Errors that can occur while validating or executing a snippet.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Code failed a pre-parse check (empty, oversized nesting, ...).
    #[error("code validation failed: {reason}")]
    ValidationFailed {
        /// What went wrong.
        reason: String,
    },

    /// Code exceeds the configured maximum size.
    #[error("code exceeds maximum size of {max} bytes (got {actual})")]
    CodeTooLarge {
        /// Maximum allowed size.
        max: usize,
        /// Actual size.
        actual: usize,
    },

    /// The snippet is not parseable as source text.
    #[error("snippet could not be parsed: {message}")]
    SyntaxError {
        /// Parser diagnostic.
        message: String,
    },

    /// The snippet contains a construct outside the allowlist.
    #[error("unsafe construct rejected: {construct}")]
    UnsafeCode {
        /// The offending construct's kind.
        construct: String,
    },

    /// Execution exceeded the wall-clock deadline.
    #[error("execution timed out after {timeout_ms}ms")]
    Timeout {
        /// Configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// Execution exceeded the total loop-iteration budget.
    #[error("loop iteration budget exhausted (max {max})")]
    IterationBudget {
        /// Configured maximum total iterations.
        max: u64,
    },

    /// The reply body exceeds the configured maximum serialized size.
    /// The body is never silently truncated; the whole request fails instead.
    #[error("reply body exceeds maximum size of {max} bytes")]
    ResultTooLarge {
        /// Maximum allowed size.
        max: usize,
    },

    /// The snippet finished without binding a usable `REPLY`.
    #[error("snippet produced no usable reply: {reason}")]
    MissingReply {
        /// Why the reply was unusable.
        reason: String,
    },

    /// The snippet raised an exception that nothing caught, or hit a runtime
    /// fault (unknown name, bad operand types, ...).
    #[error("snippet raised: {message}")]
    SnippetError {
        /// The failure message, truncated to the diagnostic cap.
        message: String,
    },

    /// A store operation failed at the durable layer. Not catchable from
    /// snippet code.
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),

    /// Too many concurrent executions.
    #[error("concurrency limit reached (max {max} concurrent executions)")]
    ConcurrencyLimit {
        /// Maximum allowed concurrent executions.
        max: usize,
    },

    /// The execution thread died or the result channel broke.
    #[error("execution harness failure: {message}")]
    Internal {
        /// Diagnostic message.
        message: String,
    },
}
