use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Args;
use serde_json::json;
use tracing::{debug, warn};

use coderun_core::{Event, EventKind, Problem, RunRequest, SessionRegistry, SessionState};
use coderun_logging::{LogEvent, LogFormat, Logger, StreamType};
use coderun_sandbox::{Language, LimitOverrides};

use crate::config::ProjectConfig;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Source file to execute
    pub file: PathBuf,

    /// Language (default: from the file extension)
    #[arg(short, long)]
    pub language: Option<String>,

    /// Workspace id (default: the file path)
    #[arg(short, long)]
    pub workspace: Option<String>,

    /// Wall-clock limit, e.g. `500ms` or `30s`
    #[arg(long, value_parser = crate::parse_duration)]
    pub timeout: Option<Duration>,

    /// Memory limit in bytes
    #[arg(long)]
    pub max_memory: Option<u64>,

    /// Output cap in bytes
    #[arg(long)]
    pub max_output: Option<u64>,

    /// Print the final session and its problems as JSON on stdout
    #[arg(long)]
    pub json_output: bool,
}

impl RunArgs {
    fn language(&self) -> Result<String> {
        if let Some(language) = &self.language {
            return Ok(language.clone());
        }
        match Language::from_path(&self.file) {
            Some(language) => Ok(language.to_string()),
            None => bail!(
                "Cannot infer the language of {}; pass --language",
                self.file.display()
            ),
        }
    }

    fn overrides(&self) -> LimitOverrides {
        LimitOverrides {
            timeout: self.timeout,
            max_memory: self.max_memory,
            max_output_bytes: self.max_output,
        }
    }
}

/// Run one file to completion. Returns the process exit code.
pub async fn handle_run_command(
    args: RunArgs,
    config: &ProjectConfig,
    log_format: LogFormat,
) -> Result<i32> {
    let source = std::fs::read_to_string(&args.file)
        .with_context(|| format!("Failed to read {}", args.file.display()))?;
    let language = args.language()?;
    let workspace = args
        .workspace
        .clone()
        .unwrap_or_else(|| args.file.display().to_string());

    let registry = SessionRegistry::new(
        config.sandbox_runner(),
        config.registry_config(),
        config.limit_policy(),
    );
    let archive_dir = config.archive_dir()?;

    let logger = Logger::new(log_format);
    let request = RunRequest::new(&workspace, &language, source).with_limits(args.overrides());
    let id = match registry.submit(request) {
        Ok(id) => id,
        Err(e) => {
            logger.log(&LogEvent::ErrorEncountered {
                error: e.to_string(),
            });
            return Ok(2);
        }
    };

    let archiver = archive_dir.map(|dir| {
        let registry = registry.clone();
        tokio::spawn(async move { coderun_core::archive_run(&registry, id, &dir).await })
    });

    {
        let registry = registry.clone();
        ctrlc::set_handler(move || {
            let _ = registry.cancel(id);
        })
        .context("Failed to install Ctrl+C handler")?;
    }

    logger.log(&LogEvent::RunStarted {
        session_id: id.to_string(),
        workspace_id: workspace.clone(),
        language: language.clone(),
        source_name: args.file.display().to_string(),
    });

    let mut events = registry.subscribe(id, 1)?;
    while let Some(event) = events.next().await {
        if let Some(log_event) = to_log_event(&event) {
            logger.log(&log_event);
        }
    }

    let session = registry.wait(id).await?;
    let problems = registry.problems(id)?;
    logger.log(&LogEvent::RunCompleted {
        state: session.state.to_string(),
        exit_code: session.exit_code,
        duration_secs: session.duration_secs().unwrap_or(0.0),
        problems: problems.len(),
    });

    if args.json_output {
        let output = json!({ "session": session, "problems": problems });
        println!("{}", serde_json::to_string_pretty(&output)?);
    }

    if let Some(handle) = archiver {
        match handle.await {
            Ok(Ok(path)) => debug!(path = %path.display(), "Run archived"),
            Ok(Err(e)) => warn!(error = %e, "Failed to archive run"),
            Err(e) => warn!(error = %e, "Archive task failed"),
        }
    }

    Ok(exit_code(session.state, session.exit_code))
}

/// Mirror the program's own exit code for ordinary failures
fn exit_code(state: SessionState, program_code: Option<i32>) -> i32 {
    match (state, program_code) {
        (SessionState::Failed, Some(code)) if code > 0 => code,
        _ => state.cli_exit_code(),
    }
}

fn to_log_event(event: &Event) -> Option<LogEvent> {
    match event.kind {
        EventKind::Stdout => Some(LogEvent::OutputLine {
            seq: event.seq,
            stream: StreamType::Stdout,
            line: event.payload.clone(),
        }),
        EventKind::Stderr => Some(LogEvent::OutputLine {
            seq: event.seq,
            stream: StreamType::Stderr,
            line: event.payload.clone(),
        }),
        EventKind::Diagnostic => {
            let problem: Problem = serde_json::from_str(&event.payload).ok()?;
            Some(LogEvent::DiagnosticReported {
                seq: event.seq,
                severity: problem.diagnostic.severity.to_string(),
                location: problem.diagnostic.location_label(),
                message: problem.diagnostic.message,
            })
        }
        EventKind::Lifecycle => Some(LogEvent::Lifecycle {
            seq: event.seq,
            marker: event.payload.clone(),
        }),
    }
}
