use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;

use crate::{CommandSpec, Language, MemoryStrategy, ResourceLimits, Toolchain};

/// CPython toolchain implementation
pub struct PythonToolchain {
    binary_path: PathBuf,
}

impl PythonToolchain {
    pub fn new() -> Self {
        Self {
            binary_path: PathBuf::from("python3"),
        }
    }

    pub fn with_binary_path(path: PathBuf) -> Self {
        Self { binary_path: path }
    }
}

impl Default for PythonToolchain {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Toolchain for PythonToolchain {
    fn name(&self) -> &str {
        "CPython"
    }

    fn language(&self) -> Language {
        Language::Python
    }

    fn binary_path(&self) -> &Path {
        &self.binary_path
    }

    fn source_file_name(&self) -> &'static str {
        "main.py"
    }

    fn run_command(&self, scratch: &Path, _limits: &ResourceLimits) -> CommandSpec {
        // -u keeps stdout unbuffered so lines stream as they are printed
        CommandSpec::new(&self.binary_path, MemoryStrategy::AddressSpace)
            .arg("-B")
            .arg("-u")
            .arg(scratch.join(self.source_file_name()).to_string_lossy())
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .env("PYTHONIOENCODING", "utf-8")
    }

    fn memory_exhaustion_markers(&self) -> &'static [&'static str] {
        &["MemoryError", "Cannot allocate memory"]
    }

    async fn is_available(&self) -> bool {
        Command::new(&self.binary_path)
            .arg("--version")
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }
}
