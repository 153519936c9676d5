//! Logging bootstrap shared by the four process entry points.
//!
//! Mirrors the teacher's `tracing_subscriber::fmt` wiring at process start,
//! generalized to pick a compact or JSON formatter from `LOG_FORMAT` so the
//! `intake` web process and the batch binaries (`revoke-worker`,
//! `reconciler`, `syncer`) share one init path.

use tracing_subscriber::{fmt, EnvFilter};

/// Install a global `tracing` subscriber. Safe to call once per process;
/// panics if a subscriber is already installed, which would indicate a
/// programming error rather than a recoverable condition.
pub fn init(process_name: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let subscriber = fmt().with_env_filter(filter).with_target(true);

    if json {
        subscriber.json().init();
    } else {
        subscriber.compact().init();
    }

    tracing::info!(process = process_name, "telemetry initialized");
}

/// The `{ok, errors}` status contract every process entry point returns
/// (spec §6) before exiting.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProcessStatus {
    pub ok: bool,
    pub errors: Vec<String>,
}

impl ProcessStatus {
    pub fn ok() -> Self {
        Self { ok: true, errors: Vec::new() }
    }

    pub fn from_errors(errors: Vec<String>) -> Self {
        Self { ok: errors.is_empty(), errors }
    }

    pub fn log_and_print(&self, process_name: &str) {
        if self.ok {
            tracing::info!(process = process_name, "completed successfully");
        } else {
            tracing::error!(process = process_name, errors = ?self.errors, "completed with errors");
        }
        match serde_json::to_string(self) {
            Ok(line) => println!("{line}"),
            Err(e) => eprintln!("{{\"ok\":false,\"errors\":[\"status serialization failed: {e}\"]}}"),
        }
    }
}
