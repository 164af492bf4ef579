//! Logging Module
//!
//! Structured logging to the console and a daily rolling file.

use std::path::PathBuf;

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const LOG_FILE: &str = "lynkco-sync.log";

/// Initialize logging with console and file output
pub fn init() {
    let log_dir = log_directory();

    // File output is best effort; console logging still works without it.
    let file_layer = match std::fs::create_dir_all(&log_dir) {
        Ok(()) => Some(
            fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(RollingFileAppender::new(Rotation::DAILY, &log_dir, LOG_FILE)),
        ),
        Err(_) => None,
    };

    let console_layer = fmt::layer().with_target(true).compact();

    let subscriber = tracing_subscriber::registry()
        .with(default_filter())
        .with(file_layer)
        .with(console_layer);

    // A subscriber may already be installed by an embedding host.
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        #[cfg(debug_assertions)]
        {
            EnvFilter::new("debug,hyper=warn,reqwest=warn")
        }
        #[cfg(not(debug_assertions))]
        {
            EnvFilter::new("info,hyper=warn,reqwest=warn")
        }
    })
}

/// Directory holding the rolling log files
pub fn log_directory() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("LynkCoSync")
        .join("logs")
}
