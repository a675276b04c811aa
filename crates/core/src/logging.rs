//! Structured logging setup.
//!
//! Supports two modes:
//! - Development: pretty-printed human-readable logs
//! - Production: JSON-formatted logs for log aggregation
//!
//! Set `EXPERTLINK_LOG_FORMAT=json` for JSON logs.
//! Set `RUST_LOG` to control log levels (default: info).

use std::sync::atomic::{AtomicBool, Ordering};

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::FallbackLog;

/// Log format mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Pretty-printed human-readable logs (default).
    Pretty,
    /// JSON-formatted logs.
    Json,
}

impl LogFormat {
    /// Detect log format from environment.
    pub fn from_env() -> Self {
        Self::parse(&std::env::var("EXPERTLINK_LOG_FORMAT").unwrap_or_default())
    }

    fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Pretty,
        }
    }
}

/// Install the global subscriber.
///
/// Respects `RUST_LOG` (default: "info") and `EXPERTLINK_LOG_FORMAT`.
/// Returns an error if a global subscriber is already set.
pub fn try_init() -> Result<(), tracing_subscriber::util::TryInitError> {
    try_init_with_level_and_format(None, LogFormat::from_env())
}

/// Like [`try_init`], ignoring an already-installed subscriber. Safe to call
/// from every test.
pub fn init() {
    let _ = try_init();
}

/// Install the global subscriber with an explicit fallback level and format.
///
/// `level` is used when `RUST_LOG` is unset (e.g. `"debug"`, `"warn"`).
pub fn try_init_with_level_and_format(
    level: Option<&str>,
    format: LogFormat,
) -> Result<(), tracing_subscriber::util::TryInitError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.unwrap_or("info")));

    match format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(false)
                    .with_line_number(false),
            )
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init(),
    }
}

/// Gate for fallback warnings according to a [`FallbackLog`] policy.
///
/// One gate per kind of fallback (compiler backend, exchange path).
#[derive(Debug)]
pub struct FallbackNotice {
    policy: FallbackLog,
    fired: AtomicBool,
}

impl FallbackNotice {
    pub fn new(policy: FallbackLog) -> Self {
        Self {
            policy,
            fired: AtomicBool::new(false),
        }
    }

    /// Whether the current fallback should be logged.
    pub fn should_log(&self) -> bool {
        match self.policy {
            FallbackLog::Silent => false,
            FallbackLog::Always => true,
            FallbackLog::Once => !self.fired.swap(true, Ordering::Relaxed),
        }
    }

    pub fn policy(&self) -> FallbackLog {
        self.policy
    }
}
