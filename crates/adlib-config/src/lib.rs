#![warn(missing_docs)]

//! # adlib-config
//!
//! Configuration loading for the adlib metaservice.
//!
//! Supports TOML configuration files with environment variable expansion.
//!
//! ## Example
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8080"
//! auth_token = "${ADLIB_AUTH_TOKEN}"
//!
//! [store]
//! data_root = "/var/lib/adlib"
//!
//! [sandbox]
//! max_exec_ms = 8000
//! max_result_bytes = 32768
//! max_concurrent = 8
//!
//! [oracle]
//! provider = "openai"
//! model = "gpt-4o-mini"
//! ```

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Errors from config parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level adlib configuration. Every field has a production default so an
/// empty file (or no file) is a valid configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdlibConfig {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Durable store settings.
    #[serde(default)]
    pub store: StoreConfig,

    /// Sandbox execution overrides.
    #[serde(default)]
    pub sandbox: SandboxOverrides,

    /// Planning oracle settings.
    #[serde(default)]
    pub oracle: OracleConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    /// Listen address, e.g. `0.0.0.0:8080`.
    #[serde(default)]
    pub listen: Option<String>,

    /// Bearer token required on every request. Unset disables auth.
    #[serde(default)]
    pub auth_token: Option<String>,
}

/// Durable store settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
    /// Root directory for tenant data. Defaults to `/tmp/adlib_data`.
    #[serde(default)]
    pub data_root: Option<String>,
}

/// Sandbox execution overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SandboxOverrides {
    /// Snippet execution timeout in milliseconds.
    #[serde(default)]
    pub max_exec_ms: Option<u64>,

    /// Maximum snippet size in bytes.
    #[serde(default)]
    pub max_code_size: Option<usize>,

    /// Maximum serialized reply body size in bytes.
    #[serde(default)]
    pub max_result_bytes: Option<usize>,

    /// Maximum diagnostic message length in bytes.
    #[serde(default)]
    pub max_log_bytes: Option<usize>,

    /// Maximum concurrent snippet executions.
    #[serde(default)]
    pub max_concurrent: Option<usize>,

    /// Total loop-iteration budget per execution.
    #[serde(default)]
    pub max_loop_iterations: Option<u64>,
}

/// Planning oracle settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OracleConfig {
    /// Provider name: "openai" or "anthropic".
    #[serde(default)]
    pub provider: Option<String>,

    /// Model identifier passed to the provider.
    #[serde(default)]
    pub model: Option<String>,
}

impl AdlibConfig {
    /// Parse a config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: AdlibConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse a config from a TOML string, expanding `${ENV_VAR}` references.
    pub fn from_toml_with_env(toml_str: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(toml_str);
        Self::from_toml(&expanded)
    }

    /// Load config from a file path, expanding environment variables.
    pub fn from_file_with_env(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_with_env(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(provider) = &self.oracle.provider {
            match provider.as_str() {
                "openai" | "anthropic" => {}
                other => {
                    return Err(ConfigError::Invalid(format!(
                        "unsupported oracle provider '{other}', supported: openai, anthropic"
                    )))
                }
            }
        }
        if self.sandbox.max_exec_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "sandbox.max_exec_ms must be positive".into(),
            ));
        }
        if self.sandbox.max_result_bytes == Some(0) {
            return Err(ConfigError::Invalid(
                "sandbox.max_result_bytes must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string using environment variables.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(value) => result.push_str(&value),
                Err(_) => {
                    // Leave the placeholder if env var not found
                    result.push_str(&format!("${{{var_name}}}"));
                }
            }
        } else {
            result.push(ch);
        }
    }

    result
}
