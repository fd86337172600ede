use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// How hard the sandbox tries to isolate a process from the host
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    /// Refuse to start a process when namespaces or the read-only mount
    /// cannot be set up
    Strict,
    /// Apply namespaces and mounts when the kernel allows it, otherwise run
    /// with rlimits only
    #[default]
    BestEffort,
    /// Rlimits and a private scratch directory only
    Disabled,
}

/// Host-side sandbox settings shared by every run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SandboxPolicy {
    pub isolation: IsolationMode,
    /// Allow network access from sandboxed processes
    pub network: bool,
    /// Mount the host filesystem read-only, leaving only the scratch
    /// directory writable
    pub read_only_root: bool,
    /// Time between SIGTERM and SIGKILL when a process is terminated
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,
    /// Parent directory for per-run scratch directories (system temp dir if unset)
    pub scratch_root: Option<PathBuf>,
    /// Largest file a process may write
    pub max_scratch_bytes: u64,
    pub max_open_files: u64,
    /// Host environment variables passed through to sandboxed processes
    pub env_passthrough: Vec<String>,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            isolation: IsolationMode::BestEffort,
            network: false,
            read_only_root: true,
            grace_period: Duration::from_secs(2),
            scratch_root: None,
            max_scratch_bytes: 64 * 1024 * 1024,
            max_open_files: 256,
            env_passthrough: [
                "PATH",
                "LANG",
                "LC_ALL",
                "RUSTUP_HOME",
                "CARGO_HOME",
                "RUSTUP_TOOLCHAIN",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl SandboxPolicy {
    pub fn with_isolation(mut self, isolation: IsolationMode) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_scratch_root(mut self, root: PathBuf) -> Self {
        self.scratch_root = Some(root);
        self
    }

    /// Whether the process should be moved into a fresh user namespace
    pub fn wants_namespaces(&self) -> bool {
        self.isolation != IsolationMode::Disabled && (!self.network || self.read_only_root)
    }

    /// Whether the process gets a private mount namespace with a read-only root
    pub fn confines_filesystem(&self) -> bool {
        self.isolation != IsolationMode::Disabled && self.read_only_root
    }
}
