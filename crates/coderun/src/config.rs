//! Project configuration file support for coderun.
//!
//! Loads configuration from `coderun.toml` in the working directory, or from
//! an explicit path given with `--config`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use coderun_core::{LimitPolicy, RegistryConfig};
use coderun_sandbox::{create_toolchain, Language, ResourceLimits, SandboxPolicy, SandboxRunner};

/// Project-level configuration loaded from `coderun.toml`
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    /// Defaults for requests that omit limits
    #[serde(default)]
    pub limits: LimitsSection,
    /// Maximums a request may ask for
    #[serde(default)]
    pub ceiling: LimitsSection,
    #[serde(default)]
    pub sandbox: SandboxPolicy,
    #[serde(default)]
    pub registry: RegistryConfig,
    /// Custom interpreter / compiler paths
    #[serde(default)]
    pub toolchains: ToolchainPaths,
    #[serde(default)]
    pub archive: ArchiveConfig,
}

/// A partial set of resource limits; unset fields keep their defaults
#[derive(Debug, Deserialize, Default, Clone, Copy)]
#[serde(deny_unknown_fields)]
pub struct LimitsSection {
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    pub max_memory: Option<u64>,
    pub max_output_bytes: Option<u64>,
}

impl LimitsSection {
    fn apply(&self, base: ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            timeout: self.timeout.unwrap_or(base.timeout),
            max_memory: self.max_memory.unwrap_or(base.max_memory),
            max_output_bytes: self.max_output_bytes.unwrap_or(base.max_output_bytes),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ToolchainPaths {
    pub node: Option<PathBuf>,
    pub python: Option<PathBuf>,
    pub shell: Option<PathBuf>,
    pub rust: Option<PathBuf>,
}

impl ToolchainPaths {
    pub fn get(&self, language: Language) -> Option<&PathBuf> {
        match language {
            Language::Node => self.node.as_ref(),
            Language::Python => self.python.as_ref(),
            Language::Shell => self.shell.as_ref(),
            Language::Rust => self.rust.as_ref(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ArchiveConfig {
    /// Write a JSONL record of every run
    #[serde(default)]
    pub enabled: bool,
    /// Archive directory (default: `<data_dir>/coderun/runs`)
    pub dir: Option<PathBuf>,
}

/// The config file name
pub const CONFIG_FILE_NAME: &str = "coderun.toml";

impl ProjectConfig {
    /// Load configuration from the working directory.
    ///
    /// Returns:
    /// - `Ok(Some(config))` if file exists and parses successfully
    /// - `Ok(None)` if file does not exist
    /// - `Err(...)` if file exists but fails to parse (hard error)
    pub fn load(working_dir: &Path) -> Result<Option<Self>> {
        let config_path = working_dir.join(CONFIG_FILE_NAME);

        if !config_path.exists() {
            return Ok(None);
        }

        Self::load_file(&config_path).map(Some)
    }

    /// Load an explicit config file; a missing file is an error here
    pub fn load_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        let config: ProjectConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        Ok(config)
    }

    /// Resolve `--config` if given, otherwise `coderun.toml` in `working_dir`,
    /// otherwise defaults
    pub fn resolve(explicit: Option<&Path>, working_dir: &Path) -> Result<Self> {
        match explicit {
            Some(path) => Self::load_file(path),
            None => Ok(Self::load(working_dir)?.unwrap_or_default()),
        }
    }

    pub fn limit_policy(&self) -> LimitPolicy {
        let base = LimitPolicy::default();
        LimitPolicy {
            defaults: self.limits.apply(base.defaults),
            ceiling: self.ceiling.apply(base.ceiling),
        }
    }

    /// Build the sandbox runner with any custom toolchain paths applied
    pub fn sandbox_runner(&self) -> SandboxRunner {
        let mut runner = SandboxRunner::new(self.sandbox.clone());
        for language in Language::ALL {
            if let Some(path) = self.toolchains.get(language) {
                runner = runner.with_toolchain(Arc::from(create_toolchain(
                    language,
                    Some(path.clone()),
                )));
            }
        }
        runner
    }

    pub fn registry_config(&self) -> RegistryConfig {
        self.registry.clone()
    }

    /// Archive directory if archiving is enabled
    pub fn archive_dir(&self) -> Result<Option<PathBuf>> {
        if !self.archive.enabled {
            return Ok(None);
        }
        match &self.archive.dir {
            Some(dir) => Ok(Some(dir.clone())),
            None => Ok(Some(
                coderun_logging::RunArchive::default_dir()
                    .context("Failed to determine archive directory")?,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coderun_sandbox::IsolationMode;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, contents: &str) {
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), contents).unwrap();
    }

    #[test]
    fn test_missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(ProjectConfig::load(dir.path()).unwrap().is_none());

        let resolved = ProjectConfig::resolve(None, dir.path()).unwrap();
        assert_eq!(resolved.limit_policy(), LimitPolicy::default());
    }

    #[test]
    fn test_full_config() {
        let dir = TempDir::new().unwrap();
        write_config(
            &dir,
            r#"
[limits]
timeout = "5s"
max_output_bytes = 4096

[ceiling]
timeout = "30s"

[sandbox]
isolation = "strict"
grace_period = "500ms"

[registry]
history_per_workspace = 3

[toolchains]
node = "/opt/node/bin/node"

[archive]
enabled = true
dir = "/tmp/coderun-archive"
"#,
        );

        let config = ProjectConfig::load(dir.path()).unwrap().unwrap();
        let policy = config.limit_policy();
        assert_eq!(policy.defaults.timeout, Duration::from_secs(5));
        assert_eq!(policy.defaults.max_output_bytes, 4096);
        assert_eq!(policy.defaults.max_memory, ResourceLimits::default().max_memory);
        assert_eq!(policy.ceiling.timeout, Duration::from_secs(30));
        assert_eq!(config.sandbox.isolation, IsolationMode::Strict);
        assert_eq!(config.sandbox.grace_period, Duration::from_millis(500));
        assert_eq!(config.registry.history_per_workspace, 3);
        assert_eq!(config.registry.max_source_bytes, RegistryConfig::default().max_source_bytes);
        assert_eq!(
            config.toolchains.get(Language::Node),
            Some(&PathBuf::from("/opt/node/bin/node"))
        );
        assert_eq!(
            config.archive_dir().unwrap(),
            Some(PathBuf::from("/tmp/coderun-archive"))
        );

        let runner = config.sandbox_runner();
        let node = runner.toolchain(Language::Node).unwrap();
        assert_eq!(node.binary_path(), Path::new("/opt/node/bin/node"));
    }

    #[test]
    fn test_unknown_field_is_an_error() {
        let dir = TempDir::new().unwrap();
        write_config(&dir, "[limits]\ntimeout = \"5s\"\nbogus = 1\n");
        assert!(ProjectConfig::load(dir.path()).is_err());
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        write_config(&dir, "[limits\n");
        assert!(ProjectConfig::load(dir.path()).is_err());
    }

    #[test]
    fn test_explicit_path_must_exist() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(ProjectConfig::resolve(Some(&missing), dir.path()).is_err());
    }

    #[test]
    fn test_archive_disabled_by_default() {
        let config = ProjectConfig::default();
        assert_eq!(config.archive_dir().unwrap(), None);
    }
}
