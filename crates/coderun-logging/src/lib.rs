//! # coderun-logging
//!
//! Logging for the coderun execution service.
//!
//! ## Key Types
//!
//! - [`Logger`] - Renders run events to the console
//! - [`LogEvent`] - Log event types
//! - [`LogFormat`] - Output formats (Pretty, JSON, Compact)
//! - [`RunArchive`] - JSONL record of a finished or running session
//!
//! ## Log Formats
//!
//! - `Pretty` - Human-readable colored output
//! - `JSON` - Structured JSON lines
//! - `Compact` - Minimal text output

mod archive;
mod events;

pub use archive::{ArchiveLine, RunArchive};
pub use events::{LogEvent, LogFormat, Logger, StreamType};

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Initialize tracing for the application
pub fn init_tracing(level: &str, format: LogFormat) {
    let filter = env_filter(level);

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_target(false).with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Pretty | LogFormat::Compact => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
                .init();
        }
    }
}

/// Initialize tracing with an additional daily-rolling JSON log file in `dir`.
///
/// The returned guard flushes the file writer on drop; keep it alive for the
/// lifetime of the process.
pub fn init_tracing_with_dir(level: &str, format: LogFormat, dir: &Path) -> std::io::Result<WorkerGuard> {
    std::fs::create_dir_all(dir)?;
    let appender = tracing_appender::rolling::daily(dir, "coderun.log");
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter(level))
                .with(fmt::layer().json().with_target(false).with_writer(std::io::stderr))
                .with(fmt::layer().json().with_ansi(false).with_writer(file_writer))
                .init();
        }
        LogFormat::Pretty | LogFormat::Compact => {
            tracing_subscriber::registry()
                .with(env_filter(level))
                .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
                .with(fmt::layer().json().with_ansi(false).with_writer(file_writer))
                .init();
        }
    }
    Ok(guard)
}
