//! Logging utilities for the device health components.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human readable single-line output
    #[default]
    Plain,
    /// One JSON object per line
    Json,
}

impl LogFormat {
    /// Parse a configured format name. Anything other than `json` is plain.
    pub fn from_name(name: Option<&str>) -> Self {
        match name.map(str::to_ascii_lowercase).as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Plain,
        }
    }
}

fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Initialize tracing with the given default level and format.
///
/// The RUST_LOG environment variable, when set, overrides `default_level`.
pub fn init(default_level: &str, format: LogFormat) {
    match format {
        LogFormat::Plain => tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter(default_level))
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter(default_level))
            .init(),
    }
}

/// Initialize tracing at INFO with plain output.
pub fn init_default() {
    init("info", LogFormat::Plain);
}
