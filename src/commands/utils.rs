use anyhow::{Context, Result};
use chrono::Duration;
use std::path::PathBuf;

use crate::config::{LoggingConfig, get_agent_config_path};

/// Initialize logging
///
/// `--verbose` wins over the configured level; `RUST_LOG` wins over both.
pub fn init_logging(verbose: bool, logging: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let level = if verbose { "debug" } else { logging.level.as_str() };

    let file_layer = match &logging.file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                crate::platform::common::ensure_directory_exists(parent)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(file_layer)
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))
}

/// The config file named on the command line, or the system location
pub fn resolve_config_path(arg: Option<PathBuf>) -> Result<PathBuf> {
    match arg {
        Some(path) => Ok(path),
        None => get_agent_config_path(),
    }
}

/// Format duration for display
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.num_seconds();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else if secs < 86400 {
        format!("{}h", secs / 3600)
    } else {
        format!("{}d", secs / 86400)
    }
}

/// Print sudo message based on OS
pub fn print_sudo_message() {
    #[cfg(unix)]
    eprintln!(
        "Please run with sudo: sudo {}",
        std::env::args().next().unwrap_or_else(|| "kiosk-agent".to_string())
    );

    #[cfg(windows)]
    eprintln!("Please run this program as Administrator.");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration_picks_largest_unit() {
        assert_eq!(format_duration(Duration::seconds(42)), "42s");
        assert_eq!(format_duration(Duration::minutes(5)), "5m");
        assert_eq!(format_duration(Duration::hours(3)), "3h");
        assert_eq!(format_duration(Duration::days(2)), "2d");
    }

    #[test]
    fn test_explicit_config_path_is_used() {
        let path = resolve_config_path(Some(PathBuf::from("custom.conf"))).unwrap();
        assert_eq!(path, PathBuf::from("custom.conf"));
    }
}
