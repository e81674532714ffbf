//! Structured logging initialization from [`LoggingConfig`].
//!
//! Builds a `tracing-subscriber` stack honoring the configured level,
//! console and/or file outputs, and JSON formatting. Console and file are
//! independent switches; enabling both tees every record to both sinks.
//! Initialization is idempotent: repeated calls after the first are
//! no-ops.

use crate::config::LoggingConfig;
use crate::error::{ConduitError, Result};
use std::fs::File;
use std::io::Write;
use std::sync::{Arc, Mutex};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;

/// Writer fanning each record out to the enabled sinks.
struct TeeWriter {
    console: bool,
    file: Option<Arc<Mutex<File>>>,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.console {
            std::io::stdout().write_all(buf)?;
        }
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                file.write_all(buf)?;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if self.console {
            std::io::stdout().flush()?;
        }
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                file.flush()?;
            }
        }
        Ok(())
    }
}

/// Install the global tracing subscriber from the given configuration.
///
/// # Errors
/// Returns `ConduitError::ConfigError` if the log file cannot be opened.
/// A subscriber already being installed is not an error.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let level = LevelFilter::from_level(config.log_level);

    let file = if config.log_to_file {
        let path = config
            .log_file_path
            .as_deref()
            .ok_or_else(|| ConduitError::ConfigError("log_file_path not set".into()))?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| ConduitError::ConfigError(format!("Failed to open log file: {e}")))?;
        Some(Arc::new(Mutex::new(file)))
    } else {
        None
    };

    let console = config.log_to_console;
    let make_writer = move || TeeWriter {
        console,
        file: file.clone(),
    };

    // ANSI escapes would pollute the file copy of teed records
    let builder = fmt()
        .with_max_level(level)
        .with_writer(make_writer)
        .with_ansi(config.log_to_console && !config.log_to_file);
    let result = if config.json_format {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if result.is_err() {
        tracing::debug!("Global subscriber already installed; keeping existing one");
    }
    Ok(())
}
