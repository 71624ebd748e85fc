//! Structured logging using the tracing crate
//!
//! Provides contextual, machine-readable logging with span macros for the
//! bridge's operations.
//!
//! ## Log Format Options
//!
//! The `LOG_FORMAT` environment variable selects one of:
//!
//! - `json` - Structured JSON for log aggregation (default)
//! - `pretty` - Human-readable, coloured, indented
//! - `compact` - Coloured single lines for terminals
//!
//! ## Environment Variables
//!
//! - `LOG_LEVEL`: ERROR, WARN, INFO, DEBUG, TRACE - defaults to INFO
//! - `LOG_FORMAT`: json, pretty, compact - defaults to json
//! - `LOG_SPANS`: include span open/close events (true/false) - defaults to false
//! - `RUST_LOG`: overrides filtering entirely
//!
//! ## Examples
//!
//! ```bash
//! # On the edge device
//! LOG_FORMAT=json LOG_LEVEL=INFO edge-ptm run
//!
//! # Local debugging
//! LOG_FORMAT=pretty LOG_LEVEL=DEBUG edge-ptm run --sensors readings.jsonl
//! ```

use std::env;
use tracing::Level;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Dependencies whose logs are capped at warn
const NOISY_DEPENDENCIES: &[&str] = &["rumqttc", "rustls", "hyper", "reqwest", "warp", "tokio"];

/// Log output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON format for structured logging (machine-readable)
    Json,
    /// Pretty format with colors and indentation (human-readable)
    Pretty,
    /// Compact format with colors but minimal spacing (terminal-friendly)
    Compact,
}

impl LogFormat {
    /// Parse log format from string; unknown values fall back to JSON
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

/// Parse a level name; unknown values fall back to INFO
pub fn parse_level(s: &str) -> Level {
    match s.to_uppercase().as_str() {
        "ERROR" => Level::ERROR,
        "WARN" => Level::WARN,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => Level::INFO,
    }
}

/// Level filter with dependency noise capped at warn
pub fn build_filter(level: Level) -> EnvFilter {
    NOISY_DEPENDENCIES
        .iter()
        .filter_map(|target| format!("{target}=warn").parse::<Directive>().ok())
        .fold(EnvFilter::new(level.to_string()), |filter, directive| {
            filter.add_directive(directive)
        })
}

/// Initialize logging with manual configuration
///
/// A second call is a no-op: the first installed subscriber stays.
pub fn init_logging(level: Level, format: LogFormat, include_spans: bool) {
    let filter = match env::var("RUST_LOG") {
        Ok(rust_log) => EnvFilter::new(rust_log),
        Err(_) => build_filter(level),
    };
    let span_events = if include_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let subscriber = tracing_subscriber::registry().with(filter);
    let _ = match format {
        LogFormat::Json => subscriber
            .with(fmt::layer().json().with_span_events(span_events))
            .try_init(),
        LogFormat::Pretty => subscriber
            .with(
                fmt::layer()
                    .pretty()
                    .with_ansi(true)
                    .with_span_events(span_events),
            )
            .try_init(),
        LogFormat::Compact => subscriber
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_target(false)
                    .with_span_events(span_events),
            )
            .try_init(),
    };
}

/// Initialize logging from environment variables; `verbose` forces DEBUG
pub fn init_default_logging(verbose: bool) {
    let level = if verbose {
        Level::DEBUG
    } else {
        parse_level(&env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string()))
    };
    let format = LogFormat::parse(&env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string()));
    let include_spans = env::var("LOG_SPANS")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    init_logging(level, format, include_spans);
}

/// Span for bridge lifecycle operations
#[macro_export]
macro_rules! bridge_span {
    ($($field:tt)*) => {
        tracing::info_span!("bridge", $($field)*)
    };
}

/// Span for token issuance and refresh
#[macro_export]
macro_rules! credential_span {
    ($($field:tt)*) => {
        tracing::info_span!("credential", $($field)*)
    };
}

/// Span for handling one sensor reading
#[macro_export]
macro_rules! telemetry_span {
    ($($field:tt)*) => {
        tracing::debug_span!("telemetry", $($field)*)
    };
}

pub use {bridge_span, credential_span, telemetry_span};
