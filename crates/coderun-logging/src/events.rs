use colored::Colorize;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

/// Type of output stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    Stdout,
    Stderr,
}

/// Structured log events for a single run as seen by a console client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LogEvent {
    RunStarted {
        session_id: String,
        workspace_id: String,
        language: String,
        source_name: String,
    },
    /// One line of program output
    OutputLine {
        seq: u64,
        stream: StreamType,
        line: String,
    },
    DiagnosticReported {
        seq: u64,
        severity: String,
        message: String,
        location: Option<String>,
    },
    /// Lifecycle marker such as `Compiled` or `Exited(0)`
    Lifecycle {
        seq: u64,
        marker: String,
    },
    RunCompleted {
        state: String,
        exit_code: Option<i32>,
        duration_secs: f64,
        problems: usize,
    },
    ErrorEncountered {
        error: String,
    },
}

impl LogEvent {
    /// Add a timestamp to serialize with the event
    fn with_timestamp(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(obj) = value.as_object_mut() {
            obj.insert(
                "timestamp".to_string(),
                serde_json::Value::String(chrono::Utc::now().to_rfc3339()),
            );
        }
        value
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format with colors and visual structure
    #[default]
    Pretty,
    /// JSON lines format for machine consumption
    Json,
    /// Compact single-line format
    Compact,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            "compact" => Ok(LogFormat::Compact),
            _ => Err(format!("Unknown log format: {}", s)),
        }
    }
}

/// Logger for run events - handles both console output and file logging.
///
/// Program output goes to stdout so it can be piped; everything else is
/// written to stderr.
pub struct Logger {
    format: LogFormat,
    file_writer: Option<Mutex<File>>,
}

impl Logger {
    pub fn new(format: LogFormat) -> Self {
        Self {
            format,
            file_writer: None,
        }
    }

    /// Create a logger with file output in addition to console
    pub fn with_file(format: LogFormat, log_path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;

        Ok(Self {
            format,
            file_writer: Some(Mutex::new(file)),
        })
    }

    pub fn format(&self) -> LogFormat {
        self.format
    }

    pub fn log(&self, event: &LogEvent) {
        // File output is always JSON
        if let Some(ref writer) = self.file_writer {
            if let Ok(mut file) = writer.lock() {
                let json = event.with_timestamp();
                let _ = writeln!(file, "{}", json);
            }
        }

        match self.format {
            LogFormat::Json => self.log_json(event),
            LogFormat::Pretty => self.log_pretty(event),
            LogFormat::Compact => self.log_compact(event),
        }
    }

    fn log_json(&self, event: &LogEvent) {
        if let Ok(json) = serde_json::to_string(event) {
            let _ = writeln!(std::io::stderr(), "{}", json);
        }
    }

    fn log_pretty(&self, event: &LogEvent) {
        let mut stderr = std::io::stderr();
        match event {
            LogEvent::RunStarted {
                session_id,
                workspace_id,
                language,
                source_name,
            } => {
                let _ = writeln!(
                    stderr,
                    "{}",
                    "╭─────────────────────────────────────────────────────────────────────╮"
                        .bright_blue()
                );
                let _ = writeln!(
                    stderr,
                    "{}  {} {}",
                    "│".bright_blue(),
                    "coderun".bold().bright_white(),
                    Self::truncate_with_padding(source_name, 58, 60).dimmed()
                );
                let _ = writeln!(
                    stderr,
                    "{}  {} {}",
                    "│".bright_blue(),
                    "Lang:".dimmed(),
                    Self::truncate_with_padding(language, 60, 62).dimmed()
                );
                let _ = writeln!(
                    stderr,
                    "{}  {} {}",
                    "│".bright_blue(),
                    "Run:".dimmed(),
                    Self::truncate_with_padding(
                        &format!("{} ({})", session_id, workspace_id),
                        61,
                        63
                    )
                    .dimmed()
                );
                let _ = writeln!(
                    stderr,
                    "{}",
                    "╰─────────────────────────────────────────────────────────────────────╯"
                        .bright_blue()
                );
            }
            LogEvent::OutputLine { stream, line, .. } => match stream {
                StreamType::Stdout => {
                    let _ = writeln!(std::io::stdout(), "{}", line);
                }
                StreamType::Stderr => {
                    let _ = writeln!(stderr, "{}", line.red());
                }
            },
            LogEvent::DiagnosticReported {
                severity,
                message,
                location,
                ..
            } => {
                let label = if severity == "error" {
                    "✗ error".bright_red().bold()
                } else {
                    "⚠ warning".bright_yellow().bold()
                };
                match location {
                    Some(loc) => {
                        let _ = writeln!(stderr, "  {} {} {}", label, loc.dimmed(), message);
                    }
                    None => {
                        let _ = writeln!(stderr, "  {} {}", label, message);
                    }
                }
            }
            LogEvent::Lifecycle { marker, .. } => {
                let _ = writeln!(stderr, "  {} {}", "●".bright_cyan(), marker.bright_cyan());
            }
            LogEvent::RunCompleted {
                state,
                exit_code,
                duration_secs,
                problems,
            } => {
                let exit = exit_code
                    .map(|c| format!("exit {}", c))
                    .unwrap_or_else(|| "no exit code".to_string());
                let summary = format!(
                    "{} ({}, {:.2}s, {} {})",
                    state,
                    exit,
                    duration_secs,
                    problems,
                    if *problems == 1 { "problem" } else { "problems" }
                );
                let line = if state == "succeeded" {
                    format!("✓ {}", summary).bright_green()
                } else {
                    format!("✗ {}", summary).bright_red()
                };
                let _ = writeln!(stderr);
                let _ = writeln!(stderr, "{}", line);
            }
            LogEvent::ErrorEncountered { error } => {
                let _ = writeln!(stderr, "{} {}", "✗ Error:".bright_red(), error.bright_red());
            }
        }
    }

    fn log_compact(&self, event: &LogEvent) {
        let timestamp = chrono::Utc::now().format("%H:%M:%S");
        let msg = match event {
            LogEvent::RunStarted {
                session_id,
                language,
                ..
            } => format!("[{}] run:start {} {}", timestamp, language, session_id),
            LogEvent::OutputLine { stream, line, .. } => {
                // Raw output stays unprefixed on its own stream
                match stream {
                    StreamType::Stdout => {
                        let _ = writeln!(std::io::stdout(), "{}", line);
                    }
                    StreamType::Stderr => {
                        let _ = writeln!(std::io::stderr(), "{}", line);
                    }
                }
                return;
            }
            LogEvent::DiagnosticReported {
                seq,
                severity,
                message,
                location,
            } => format!(
                "[{}] {}:{} {} {}",
                timestamp,
                severity,
                seq,
                location.as_deref().unwrap_or("-"),
                message
            ),
            LogEvent::Lifecycle { seq, marker } => {
                format!("[{}] lifecycle:{} {}", timestamp, seq, marker)
            }
            LogEvent::RunCompleted {
                state,
                exit_code,
                duration_secs,
                problems,
            } => format!(
                "[{}] run:done {} exit={} {:.2}s problems={}",
                timestamp,
                state,
                exit_code.map(|c| c.to_string()).unwrap_or_else(|| "-".into()),
                duration_secs,
                problems
            ),
            LogEvent::ErrorEncountered { error } => format!("[{}] error:{}", timestamp, error),
        };
        let _ = writeln!(std::io::stderr(), "{}", msg);
    }

    /// Truncate a string and pad to exact width
    fn truncate_with_padding(s: &str, max_len: usize, total_width: usize) -> String {
        let truncated = if s.chars().count() > max_len {
            let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{}...", head)
        } else {
            s.to_string()
        };

        let padding_needed = total_width.saturating_sub(truncated.chars().count() + 1);
        format!("{}{}│", truncated, " ".repeat(padding_needed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_are_tagged() {
        let event = LogEvent::Lifecycle {
            seq: 4,
            marker: "Exited(0)".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "lifecycle");
        assert_eq!(json["seq"], 4);
        assert_eq!(json["marker"], "Exited(0)");
    }

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("compact".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert!("fancy".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_truncate_with_padding_handles_multibyte() {
        let padded = Logger::truncate_with_padding("héllo wörld", 5, 10);
        assert!(padded.starts_with("hé..."));
        assert!(padded.ends_with('│'));
        assert_eq!(padded.chars().count(), 10);
    }

    #[test]
    fn test_file_output_is_json_with_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("run.jsonl");
        let logger = Logger::with_file(LogFormat::Json, &path).unwrap();
        logger.log(&LogEvent::ErrorEncountered {
            error: "boom".to_string(),
        });

        let contents = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(contents.trim()).unwrap();
        assert_eq!(value["event"], "error_encountered");
        assert!(value["timestamp"].is_string());
    }
}
