#![warn(missing_docs)]

//! adlib: the ad-libbed REST service.
//!
//! No endpoints, no schemas, no handlers: a planning oracle improvises each
//! response and a capability-safe sandbox keeps it honest.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use adlib_config::AdlibConfig;
use adlib_sandbox::audit::TracingAuditLogger;
use adlib_sandbox::{Harness, HarnessConfig};
use adlib_server::oracle::HttpOracle;
use adlib_server::{router, AppState};
use adlib_store::SessionStore;
use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

/// Build HarnessConfig from config overrides.
fn build_harness_config(overrides: &adlib_config::SandboxOverrides) -> HarnessConfig {
    let mut config = HarnessConfig::default();
    if let Some(ms) = overrides.max_exec_ms {
        config.timeout = Duration::from_millis(ms);
    }
    if let Some(size) = overrides.max_code_size {
        config.max_code_size = size;
    }
    if let Some(size) = overrides.max_result_bytes {
        config.max_result_bytes = size;
    }
    if let Some(size) = overrides.max_log_bytes {
        config.max_log_bytes = size;
    }
    if let Some(concurrent) = overrides.max_concurrent {
        config.max_concurrent = concurrent;
    }
    if let Some(iterations) = overrides.max_loop_iterations {
        config.max_loop_iterations = iterations;
    }
    config
}

fn load_config() -> Result<AdlibConfig> {
    let mut args = std::env::args().skip(1);
    let mut config_path: Option<PathBuf> = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                config_path = Some(PathBuf::from(
                    args.next().context("--config requires a path")?,
                ));
            }
            "--help" | "-h" => {
                println!("usage: adlib [--config <path>]");
                println!();
                println!("environment:");
                println!("  ADLIB_LISTEN       listen address (default 0.0.0.0:8080)");
                println!("  ADLIB_AUTH_TOKEN   bearer token; unset disables auth");
                println!("  ADLIB_DATA_ROOT    tenant data directory");
                println!("  OPENAI_API_KEY / ANTHROPIC_API_KEY  oracle credentials");
                std::process::exit(0);
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }

    let mut config = match config_path {
        Some(path) => AdlibConfig::from_file_with_env(&path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => AdlibConfig::default(),
    };

    // Environment overrides beat the file for deploy-time knobs.
    if let Ok(token) = std::env::var("ADLIB_AUTH_TOKEN") {
        if !token.is_empty() {
            config.server.auth_token = Some(token);
        }
    }
    if let Ok(root) = std::env::var("ADLIB_DATA_ROOT") {
        if !root.is_empty() {
            config.store.data_root = Some(root);
        }
    }
    if let Ok(listen) = std::env::var("ADLIB_LISTEN") {
        if !listen.is_empty() {
            config.server.listen = Some(listen);
        }
    }

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = load_config()?;

    let data_root = config
        .store
        .data_root
        .clone()
        .unwrap_or_else(|| "/tmp/adlib_data".to_string());
    let listen = config
        .server
        .listen
        .clone()
        .unwrap_or_else(|| "0.0.0.0:8080".to_string());

    let oracle = HttpOracle::from_env(&config.oracle).context("configuring the oracle")?;

    let state = Arc::new(AppState {
        sessions: SessionStore::new(&data_root),
        harness: Harness::with_audit_logger(
            build_harness_config(&config.sandbox),
            Arc::new(TracingAuditLogger),
        ),
        oracle: Arc::new(oracle),
        auth_token: config.server.auth_token.clone(),
    });

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    tracing::info!(listen = %listen, data_root = %data_root, "adlib listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await
    .context("server error")?;

    Ok(())
}
