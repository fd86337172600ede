use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::ResourceLimits;

/// Errors that can occur while preparing or running a sandboxed process
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Failed to spawn sandboxed process: {0}")]
    SpawnFailed(#[from] std::io::Error),

    #[error("Toolchain for {language} not available at: {binary}")]
    ToolchainUnavailable { language: Language, binary: String },

    #[error("Failed to prepare scratch directory: {0}")]
    ScratchFailed(String),

    #[error("Failed to terminate process: {0}")]
    TerminateFailed(String),
}

/// Languages the sandbox knows how to build and run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Node,
    Python,
    Shell,
    Rust,
}

impl Language {
    pub const ALL: [Language; 4] = [
        Language::Node,
        Language::Python,
        Language::Shell,
        Language::Rust,
    ];

    /// Guess the language from a file extension
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "js" | "mjs" | "cjs" => Some(Language::Node),
            "py" => Some(Language::Python),
            "sh" | "bash" => Some(Language::Shell),
            "rs" => Some(Language::Rust),
            _ => None,
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Language::Node => write!(f, "node"),
            Language::Python => write!(f, "python"),
            Language::Shell => write!(f, "shell"),
            Language::Rust => write!(f, "rust"),
        }
    }
}

impl std::str::FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "node" | "nodejs" | "javascript" | "js" => Ok(Language::Node),
            "python" | "python3" | "py" => Ok(Language::Python),
            "shell" | "sh" | "bash" => Ok(Language::Shell),
            "rust" | "rs" => Ok(Language::Rust),
            _ => Err(format!("Unknown language: {}", s)),
        }
    }
}

/// How a toolchain's memory ceiling is enforced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryStrategy {
    /// `RLIMIT_AS` on the process
    AddressSpace,
    /// The interpreter enforces its own heap cap through a command-line flag
    InterpreterFlag,
    /// No memory ceiling (compilers)
    Unbounded,
}

/// Phase of a run a command belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Compile,
    Execute,
}

/// A fully resolved command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub memory: MemoryStrategy,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>, memory: MemoryStrategy) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            memory,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// The core abstraction for a language toolchain
#[async_trait]
pub trait Toolchain: Send + Sync {
    /// Human-readable name of the toolchain (e.g., "Node.js", "CPython")
    fn name(&self) -> &str;

    fn language(&self) -> Language;

    /// Get the path to the interpreter or compiler binary
    fn binary_path(&self) -> &Path;

    /// File name the submitted source is written to inside the scratch directory
    fn source_file_name(&self) -> &'static str;

    /// Command that builds the source, for compiled languages
    fn compile_command(&self, _scratch: &Path) -> Option<CommandSpec> {
        None
    }

    /// Command that executes the program
    fn run_command(&self, scratch: &Path, limits: &ResourceLimits) -> CommandSpec;

    /// Substrings on stderr that mean the program ran out of memory
    fn memory_exhaustion_markers(&self) -> &'static [&'static str] {
        &["Cannot allocate memory", "out of memory"]
    }

    /// Check if the toolchain binary is installed and runnable
    async fn is_available(&self) -> bool;
}
