/// Structured logging setup with tracing.
///
/// Honors RUST_LOG, supports json or pretty output, and an optional
/// rotating log file.

use tracing_appender::rolling;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{IndexerError, Result};

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// "trace", "debug", "info", "warn" or "error".
    pub log_level: String,
    /// "json" or "pretty".
    pub log_format: String,
    /// None means console only.
    pub log_file: Option<String>,
    /// "daily", "hourly" or "never".
    pub rotation: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            log_format: std::env::var("CLAIMDEX_LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string()),
            log_file: std::env::var("CLAIMDEX_LOG_FILE").ok(),
            rotation: "daily".to_string(),
        }
    }
}

pub fn init_tracing(config: TelemetryConfig) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if let Some(log_file_path) = config.log_file {
        let path = std::path::Path::new(&log_file_path);
        let directory = path
            .parent()
            .ok_or_else(|| IndexerError::chain("log file path has no parent directory"))?;
        let prefix = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| IndexerError::chain("log file path has no filename"))?;
        let appender = match config.rotation.as_str() {
            "hourly" => rolling::hourly(directory, prefix),
            "never" => rolling::never(directory, prefix),
            _ => rolling::daily(directory, prefix),
        };
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        if config.log_format == "json" {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(non_blocking))
                .init();
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_target(false).with_writer(non_blocking))
                .init();
        }
        // Keep the guard alive or buffered logs never flush.
        std::mem::forget(guard);
    } else if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false))
            .init();
    }
    Ok(())
}

/// Truncate a hex string for log lines.
pub fn truncate_hex(hex: &str, len: usize) -> String {
    if hex.len() <= len {
        hex.to_string()
    } else {
        format!("{}...", &hex[..len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_hex_behaviour() {
        assert_eq!(truncate_hex("abcd", 16), "abcd");
        assert_eq!(
            truncate_hex("0123456789abcdef0123456789abcdef", 16),
            "0123456789abcdef..."
        );
        assert_eq!(truncate_hex("", 16), "");
    }
}
