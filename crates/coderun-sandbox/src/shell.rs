use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;

use crate::{CommandSpec, Language, MemoryStrategy, ResourceLimits, Toolchain};

/// POSIX shell toolchain implementation
pub struct ShellToolchain {
    binary_path: PathBuf,
}

impl ShellToolchain {
    pub fn new() -> Self {
        Self {
            binary_path: PathBuf::from("sh"),
        }
    }

    pub fn with_binary_path(path: PathBuf) -> Self {
        Self { binary_path: path }
    }
}

impl Default for ShellToolchain {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Toolchain for ShellToolchain {
    fn name(&self) -> &str {
        "POSIX shell"
    }

    fn language(&self) -> Language {
        Language::Shell
    }

    fn binary_path(&self) -> &Path {
        &self.binary_path
    }

    fn source_file_name(&self) -> &'static str {
        "main.sh"
    }

    fn run_command(&self, _scratch: &Path, _limits: &ResourceLimits) -> CommandSpec {
        // Relative path so shell error messages read "main.sh: line N: ..."
        CommandSpec::new(&self.binary_path, MemoryStrategy::AddressSpace)
            .arg(self.source_file_name())
    }

    async fn is_available(&self) -> bool {
        // dash has no --version flag
        Command::new(&self.binary_path)
            .args(["-c", "exit 0"])
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }
}
