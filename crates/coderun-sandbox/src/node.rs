use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

use crate::{CommandSpec, Language, MemoryStrategy, ResourceLimits, Toolchain};

/// Node.js toolchain implementation
pub struct NodeToolchain {
    binary_path: PathBuf,
}

impl NodeToolchain {
    pub fn new() -> Self {
        Self {
            binary_path: PathBuf::from("node"),
        }
    }

    pub fn with_binary_path(path: PathBuf) -> Self {
        Self { binary_path: path }
    }
}

impl Default for NodeToolchain {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Toolchain for NodeToolchain {
    fn name(&self) -> &str {
        "Node.js"
    }

    fn language(&self) -> Language {
        Language::Node
    }

    fn binary_path(&self) -> &Path {
        &self.binary_path
    }

    fn source_file_name(&self) -> &'static str {
        "main.js"
    }

    fn run_command(&self, scratch: &Path, limits: &ResourceLimits) -> CommandSpec {
        // V8 reserves far more address space than it uses, so the heap flag
        // stands in for RLIMIT_AS here.
        let heap_mib = limits.max_memory_mib();
        debug!(heap_mib, "Node heap ceiling");

        CommandSpec::new(&self.binary_path, MemoryStrategy::InterpreterFlag)
            .arg(format!("--max-old-space-size={}", heap_mib))
            .arg(scratch.join(self.source_file_name()).to_string_lossy())
            .env("NODE_DISABLE_COLORS", "1")
    }

    fn memory_exhaustion_markers(&self) -> &'static [&'static str] {
        &[
            "JavaScript heap out of memory",
            "Reached heap limit",
            "Cannot allocate memory",
        ]
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
