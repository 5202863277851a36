//! # Structured Logging Module
//!
//! Environment-aware structured logging for the pipeline processes. Console output is
//! human-readable by default; set `PIPELINE_LOG_FORMAT=json` for one JSON object per line.

use std::sync::OnceLock;

use chrono::Utc;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Output format of the console layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    fn from_env() -> Self {
        match std::env::var("PIPELINE_LOG_FORMAT") {
            Ok(value) if value.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Pretty,
        }
    }
}

/// Initialize structured logging with environment-specific configuration
///
/// Safe to call more than once; an already-installed global subscriber is kept.
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(get_log_level(&environment)));
        let format = LogFormat::from_env();

        let layer: Box<dyn Layer<Registry> + Send + Sync> = match format {
            LogFormat::Json => fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .json()
                .with_filter(filter)
                .boxed(),
            LogFormat::Pretty => fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(true)
                .with_filter(filter)
                .boxed(),
        };

        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
        }

        tracing::info!(
            pid = std::process::id(),
            environment = %environment,
            format = ?format,
            "Structured logging initialized"
        );
    });
}

/// Get current environment from environment variables
fn get_environment() -> String {
    std::env::var("PIPELINE_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

/// Get log level based on environment
fn get_log_level(environment: &str) -> String {
    match environment {
        "production" => "info".to_string(),
        "test" | "development" => "debug".to_string(),
        _ => "debug".to_string(),
    }
}

/// Log structured data for a stage operation on one request
pub fn log_stage_operation(stage: &str, request_id: &str, status: &str, details: Option<&str>) {
    tracing::info!(
        stage = %stage,
        request_id = %request_id,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "STAGE_OPERATION"
    );
}

/// Log structured data for a broker operation
pub fn log_broker_operation(
    operation: &str,
    exchange: Option<&str>,
    queue: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        exchange = exchange,
        queue = queue,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "BROKER_OPERATION"
    );
}

/// Log error with full context
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        timestamp = %Utc::now().to_rfc3339(),
        "ERROR"
    );
}
