use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;

use crate::{CommandSpec, Language, MemoryStrategy, ResourceLimits, Toolchain};

const BINARY_NAME: &str = "main";

/// rustc toolchain implementation (compile, then run the produced binary)
pub struct RustToolchain {
    binary_path: PathBuf,
}

impl RustToolchain {
    pub fn new() -> Self {
        Self {
            binary_path: PathBuf::from("rustc"),
        }
    }

    pub fn with_binary_path(path: PathBuf) -> Self {
        Self { binary_path: path }
    }
}

impl Default for RustToolchain {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Toolchain for RustToolchain {
    fn name(&self) -> &str {
        "rustc"
    }

    fn language(&self) -> Language {
        Language::Rust
    }

    fn binary_path(&self) -> &Path {
        &self.binary_path
    }

    fn source_file_name(&self) -> &'static str {
        "main.rs"
    }

    fn compile_command(&self, _scratch: &Path) -> Option<CommandSpec> {
        let mut spec = CommandSpec::new(&self.binary_path, MemoryStrategy::Unbounded)
            .arg("--edition=2021")
            .arg("--color=never")
            .arg("-o")
            .arg(BINARY_NAME)
            .arg(self.source_file_name());

        // HOME points at the scratch dir inside the sandbox, so the rustup
        // proxy needs to be told where the real toolchains live.
        if std::env::var_os("RUSTUP_HOME").is_none() {
            if let Some(home) = dirs::home_dir() {
                spec = spec.env("RUSTUP_HOME", home.join(".rustup").to_string_lossy());
            }
        }
        Some(spec)
    }

    fn run_command(&self, scratch: &Path, _limits: &ResourceLimits) -> CommandSpec {
        CommandSpec::new(scratch.join(BINARY_NAME), MemoryStrategy::AddressSpace)
            .env("RUST_BACKTRACE", "0")
    }

    fn memory_exhaustion_markers(&self) -> &'static [&'static str] {
        &["memory allocation of", "Cannot allocate memory"]
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
