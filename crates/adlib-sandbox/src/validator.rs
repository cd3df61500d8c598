//! Pre-parse code checks.
//!
//! These run before the snippet ever reaches the parser: size cap, empty
//! code, and a bracket-nesting guard that prevents parser stack exhaustion
//! on pathologically nested input. The allowlist walk in [`crate::ast_check`]
//! is the real gate; these checks fail fast with cheaper diagnostics.

use crate::error::SandboxError;

/// Maximum nesting depth of brackets/braces/parens before rejection.
const MAX_NESTING_DEPTH: usize = 256;

/// Validate raw snippet text before parsing.
pub fn validate_source(code: &str, max_size: usize) -> Result<(), SandboxError> {
    if code.len() > max_size {
        return Err(SandboxError::CodeTooLarge {
            max: max_size,
            actual: code.len(),
        });
    }

    if code.trim().is_empty() {
        return Err(SandboxError::ValidationFailed {
            reason: "code is empty".into(),
        });
    }

    check_nesting_depth(code)
}

/// Check nesting depth of brackets/braces/parens before parsing.
fn check_nesting_depth(code: &str) -> Result<(), SandboxError> {
    let mut depth: usize = 0;
    let mut max_depth: usize = 0;
    for ch in code.chars() {
        match ch {
            '{' | '[' | '(' => {
                depth += 1;
                if depth > max_depth {
                    max_depth = depth;
                }
            }
            '}' | ']' | ')' => {
                depth = depth.saturating_sub(1);
            }
            _ => {}
        }
    }
    if max_depth > MAX_NESTING_DEPTH {
        return Err(SandboxError::ValidationFailed {
            reason: format!("nesting depth {max_depth} exceeds maximum {MAX_NESTING_DEPTH}"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_snippet() {
        assert!(validate_source("REPLY = make_response(200)", 65536).is_ok());
    }

    #[test]
    fn rejects_empty_code() {
        assert!(validate_source("", 65536).is_err());
        assert!(validate_source("   \n  ", 65536).is_err());
    }

    #[test]
    fn rejects_oversized_code() {
        let big = "x".repeat(100);
        let err = validate_source(&big, 64).unwrap_err();
        assert!(matches!(err, SandboxError::CodeTooLarge { .. }));
    }

    #[test]
    fn nesting_at_limit_is_ok_over_limit_is_not() {
        let ok = "[".repeat(MAX_NESTING_DEPTH) + &"]".repeat(MAX_NESTING_DEPTH);
        assert!(validate_source(&ok, 65536).is_ok());
        let bad = "[".repeat(MAX_NESTING_DEPTH + 1) + &"]".repeat(MAX_NESTING_DEPTH + 1);
        assert!(matches!(
            validate_source(&bad, 65536),
            Err(SandboxError::ValidationFailed { .. })
        ));
    }
}
