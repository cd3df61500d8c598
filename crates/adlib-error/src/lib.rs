//! Typed boundary errors for the adlib metaservice.
//!
//! Provides [`ApiError`], the canonical error carried from the core
//! (plan validation, code validation, execution, storage) to the transport
//! layer, with a stable HTTP status and a machine-readable reason code.
//!
//! `NotFound` is deliberately absent: a missing record is a normal outcome
//! that the executed snippet renders as a 404 reply itself. Only faults
//! travel through this type.

use thiserror::Error;

/// Canonical boundary error for request processing.
///
/// All variants are `#[non_exhaustive]` to allow future additions without
/// breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ApiError {
    /// The oracle's output failed plan schema validation.
    #[error("malformed plan: {reason}")]
    MalformedPlan {
        /// What part of the envelope was wrong.
        reason: String,
    },

    /// The embedded snippet failed the allowlist check.
    #[error("unsafe code rejected: {construct}")]
    UnsafeCode {
        /// The offending construct, as reported by the validator.
        construct: String,
    },

    /// The request body claimed to be JSON but did not parse.
    #[error("invalid JSON in request body")]
    InvalidBody,

    /// The session identifier header contains characters outside the
    /// allowed set.
    #[error("invalid session identifier")]
    InvalidSession,

    /// Bearer token missing or wrong while auth is configured.
    #[error("unauthorized")]
    Unauthorized,

    /// Snippet execution exceeded its wall-clock or iteration budget.
    #[error("execution timed out after {timeout_ms}ms")]
    ExecutionTimeout {
        /// Configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// The reply body exceeded the configured size cap.
    #[error("result exceeds maximum size of {max} bytes")]
    ResultTooLarge {
        /// Maximum allowed size.
        max: usize,
    },

    /// The snippet completed without binding a usable reply.
    #[error("snippet produced no usable reply: {reason}")]
    MissingReply {
        /// Why the reply was unusable.
        reason: String,
    },

    /// The snippet raised an exception that nothing caught.
    #[error("snippet execution failed: {message}")]
    ExecutionFailed {
        /// The (redacted) failure message.
        message: String,
    },

    /// A durable write or rename failed.
    #[error("storage failure: {message}")]
    StorageIo {
        /// The underlying I/O message.
        message: String,
    },

    /// The harness is at its concurrency cap.
    #[error("too many concurrent executions (max {max})")]
    Overloaded {
        /// Configured maximum.
        max: usize,
    },

    /// The planning oracle was unreachable or returned garbage transport.
    #[error("oracle call failed: {message}")]
    OracleFailure {
        /// The (redacted) transport-level message.
        message: String,
    },
}

impl ApiError {
    /// The HTTP status this error maps to at the boundary.
    pub fn status(&self) -> u16 {
        match self {
            Self::MalformedPlan { .. }
            | Self::UnsafeCode { .. }
            | Self::InvalidBody
            | Self::InvalidSession => 400,
            Self::Unauthorized => 401,
            Self::ExecutionTimeout { .. }
            | Self::ResultTooLarge { .. }
            | Self::MissingReply { .. }
            | Self::ExecutionFailed { .. }
            | Self::StorageIo { .. } => 500,
            Self::OracleFailure { .. } => 502,
            Self::Overloaded { .. } => 503,
        }
    }

    /// A stable reason code for programmatic matching.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedPlan { .. } => "malformed_plan",
            Self::UnsafeCode { .. } => "unsafe_code",
            Self::InvalidBody => "invalid_body",
            Self::InvalidSession => "invalid_session",
            Self::Unauthorized => "unauthorized",
            Self::ExecutionTimeout { .. } => "execution_timeout",
            Self::ResultTooLarge { .. } => "result_too_large",
            Self::MissingReply { .. } => "missing_reply",
            Self::ExecutionFailed { .. } => "execution_failed",
            Self::StorageIo { .. } => "storage_io",
            Self::OracleFailure { .. } => "oracle_failure",
            Self::Overloaded { .. } => "overloaded",
        }
    }

    /// The JSON body sent to the client for this error.
    pub fn to_body(&self) -> serde_json::Value {
        serde_json::json!({
            "error": self.code(),
            "detail": self.to_string(),
        })
    }
}

// Compile-time assertion: ApiError must be Send + Sync + 'static.
const _: fn() = || {
    fn assert_bounds<T: Send + Sync + 'static>() {}
    assert_bounds::<ApiError>();
};
