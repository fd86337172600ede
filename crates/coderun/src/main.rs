mod api;
mod config;
mod languages;
mod run;
mod serve;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use coderun_logging::LogFormat;

use crate::config::ProjectConfig;

#[derive(Parser, Debug)]
#[command(
    name = "coderun",
    about = "Sandboxed code execution sessions with live event streams",
    version,
    author
)]
struct Cli {
    /// Config file (default: ./coderun.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value = "pretty", global = true)]
    log_format: LogFormatChoice,

    /// Tracing filter (overridden by RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a source file once and stream its output
    Run(run::RunArgs),

    /// Serve the HTTP / SSE API
    Serve {
        /// Address to bind
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port to bind
        #[arg(short, long, default_value_t = 3100)]
        port: u16,

        /// Also write daily-rolling JSON logs to this directory
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },

    /// List supported languages and whether their toolchains are installed
    Languages {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormatChoice {
    Pretty,
    Json,
    Compact,
}

impl From<LogFormatChoice> for LogFormat {
    fn from(choice: LogFormatChoice) -> Self {
        match choice {
            LogFormatChoice::Pretty => LogFormat::Pretty,
            LogFormatChoice::Json => LogFormat::Json,
            LogFormatChoice::Compact => LogFormat::Compact,
        }
    }
}

/// Parse a human-readable duration such as `500ms` or `2s`
pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(s).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_format: LogFormat = cli.log_format.into();

    let working_dir = std::env::current_dir().context("Failed to get current directory")?;
    let config = ProjectConfig::resolve(cli.config.as_deref(), &working_dir)?;

    match cli.command {
        Command::Run(args) => {
            coderun_logging::init_tracing(cli.log_level.as_deref().unwrap_or("warn"), log_format);
            let code = run::handle_run_command(args, &config, log_format).await?;
            std::process::exit(code);
        }
        Command::Serve {
            host,
            port,
            log_dir,
        } => {
            let level = cli.log_level.as_deref().unwrap_or("info");
            let _guard = match log_dir {
                Some(dir) => Some(
                    coderun_logging::init_tracing_with_dir(level, log_format, &dir)
                        .with_context(|| format!("Failed to open log directory {}", dir.display()))?,
                ),
                None => {
                    coderun_logging::init_tracing(level, log_format);
                    None
                }
            };
            serve::handle_serve_command(&config, &host, port).await
        }
        Command::Languages { json } => {
            coderun_logging::init_tracing(cli.log_level.as_deref().unwrap_or("warn"), log_format);
            languages::handle_languages_command(&config, json).await
        }
    }
}
