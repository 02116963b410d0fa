/// Telemetry Module - Structured Logging with Tracing
///
/// - Structured logging with tracing
/// - JSON vs pretty format support
/// - Console or rotating-file output
/// - RUST_LOG env var support

use std::error::Error;
use std::path::Path;

use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Telemetry configuration
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Log level: "trace", "debug", "info", "warn", "error"
    pub log_level: String,
    /// Log format: "json" or "pretty"
    pub log_format: String,
    /// Optional log file path (None = console only)
    pub log_file: Option<String>,
    /// Rotation interval: "daily", "hourly", "never"
    pub rotation: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            log_format: std::env::var("CHAINMIRROR_LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string()),
            log_file: std::env::var("CHAINMIRROR_LOG_FILE").ok(),
            rotation: "daily".to_string(),
        }
    }
}

/// Install the global subscriber.
///
/// Format and destination are independent axes: the destination is resolved
/// to a writer first (console, or a non-blocking rotating file), then the
/// chosen format layer is stacked on top of it.
pub fn init_tracing(config: TelemetryConfig) -> Result<(), Box<dyn Error>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let writer = match &config.log_file {
        Some(path) => rolling_file_writer(path, &config.rotation)?,
        None => BoxMakeWriter::new(std::io::stdout),
    };

    let base = tracing_subscriber::registry().with(filter);
    if config.log_format == "json" {
        base.with(
            fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_writer(writer),
        )
        .init();
    } else {
        base.with(
            fmt::layer()
                .with_target(false)
                .with_file(true)
                .with_line_number(true)
                .with_writer(writer),
        )
        .init();
    }
    Ok(())
}

/// Non-blocking writer into a rotating log file. The flush guard must stay
/// alive for the process lifetime or buffered lines are lost.
fn rolling_file_writer(path: &str, rotation: &str) -> Result<BoxMakeWriter, Box<dyn Error>> {
    let path = Path::new(path);
    let directory = path
        .parent()
        .ok_or("log file path has no parent directory")?;
    let prefix = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .ok_or("log file path has no file name")?;

    let appender = match rotation {
        "hourly" => rolling::hourly(directory, prefix),
        "never" => rolling::never(
            directory,
            path.file_name().ok_or("log file path has no file name")?,
        ),
        _ => rolling::daily(directory, prefix),
    };

    let (writer, guard) = non_blocking(appender);
    std::mem::forget(guard);
    Ok(BoxMakeWriter::new(writer))
}

/// Truncate hex string for logging
///
/// Example: "0a1b2c3d4e5f67890a1b2c3d4e5f6789" → "0a1b2c3d4e5f6789..."
pub fn truncate_hex(hex: &str, len: usize) -> String {
    if hex.len() <= len {
        hex.to_string()
    } else {
        format!("{}...", &hex[..len])
    }
}
