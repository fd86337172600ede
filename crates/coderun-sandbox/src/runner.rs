use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::output::OutputChunk;
use crate::process::SandboxProcess;
use crate::{
    create_toolchain, CommandSpec, Language, ResourceLimits, SandboxError, SandboxPolicy,
    StepKind, Toolchain,
};

/// A single command of a run plan
#[derive(Debug, Clone)]
pub struct PlannedStep {
    pub kind: StepKind,
    pub command: CommandSpec,
}

/// Source written to a private scratch directory plus the commands to run.
///
/// The scratch directory is removed when the plan is dropped.
#[derive(Debug)]
pub struct RunPlan {
    language: Language,
    scratch: TempDir,
    steps: Vec<PlannedStep>,
}

impl RunPlan {
    pub fn language(&self) -> Language {
        self.language
    }

    pub fn scratch_path(&self) -> &Path {
        self.scratch.path()
    }

    pub fn steps(&self) -> &[PlannedStep] {
        &self.steps
    }

    pub fn has_compile_step(&self) -> bool {
        self.steps.iter().any(|s| s.kind == StepKind::Compile)
    }
}

/// Prepares and spawns sandboxed processes for every supported language
pub struct SandboxRunner {
    toolchains: HashMap<Language, Arc<dyn Toolchain>>,
    policy: SandboxPolicy,
}

impl SandboxRunner {
    pub fn new(policy: SandboxPolicy) -> Self {
        let toolchains = Language::ALL
            .iter()
            .map(|&language| (language, Arc::from(create_toolchain(language, None))))
            .collect();
        Self { toolchains, policy }
    }

    /// Replace the toolchain used for its language
    pub fn with_toolchain(mut self, toolchain: Arc<dyn Toolchain>) -> Self {
        self.toolchains.insert(toolchain.language(), toolchain);
        self
    }

    pub fn policy(&self) -> &SandboxPolicy {
        &self.policy
    }

    pub fn toolchain(&self, language: Language) -> Option<&Arc<dyn Toolchain>> {
        self.toolchains.get(&language)
    }

    /// Availability of every registered toolchain, in `Language::ALL` order
    pub async fn availability(&self) -> Vec<(Language, Arc<dyn Toolchain>, bool)> {
        let mut result = Vec::with_capacity(self.toolchains.len());
        for language in Language::ALL {
            if let Some(toolchain) = self.toolchains.get(&language) {
                let available = toolchain.is_available().await;
                result.push((language, Arc::clone(toolchain), available));
            }
        }
        result
    }

    /// Write `source` into a fresh scratch directory and resolve the step commands
    pub fn prepare(
        &self,
        language: Language,
        source: &str,
        limits: &ResourceLimits,
    ) -> Result<RunPlan, SandboxError> {
        let toolchain = self.toolchains.get(&language).ok_or_else(|| {
            SandboxError::ToolchainUnavailable {
                language,
                binary: "<none registered>".to_string(),
            }
        })?;

        let mut builder = tempfile::Builder::new();
        builder.prefix("coderun-");
        let scratch = match &self.policy.scratch_root {
            Some(root) => {
                std::fs::create_dir_all(root).map_err(|e| {
                    SandboxError::ScratchFailed(format!("{}: {}", root.display(), e))
                })?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        }
        .map_err(|e| SandboxError::ScratchFailed(e.to_string()))?;

        let source_path = scratch.path().join(toolchain.source_file_name());
        std::fs::write(&source_path, source)
            .map_err(|e| SandboxError::ScratchFailed(format!("{}: {}", source_path.display(), e)))?;

        let mut steps = Vec::with_capacity(2);
        if let Some(command) = toolchain.compile_command(scratch.path()) {
            steps.push(PlannedStep {
                kind: StepKind::Compile,
                command,
            });
        }
        steps.push(PlannedStep {
            kind: StepKind::Execute,
            command: toolchain.run_command(scratch.path(), limits),
        });

        debug!(
            %language,
            scratch = %scratch.path().display(),
            steps = steps.len(),
            "Prepared run"
        );

        Ok(RunPlan {
            language,
            scratch,
            steps,
        })
    }

    /// Start one step of `plan`, forwarding its output to `output`
    pub fn spawn(
        &self,
        plan: &RunPlan,
        step: &PlannedStep,
        limits: &ResourceLimits,
        output: mpsc::UnboundedSender<OutputChunk>,
    ) -> Result<SandboxProcess, SandboxError> {
        let process = SandboxProcess::spawn(
            plan.language,
            &step.command,
            step.kind,
            plan.scratch_path(),
            &self.policy,
            limits,
            output,
        )?;
        info!(
            language = %plan.language,
            step = ?step.kind,
            pid = ?process.id(),
            "Started sandboxed step"
        );
        Ok(process)
    }
}

impl Default for SandboxRunner {
    fn default() -> Self {
        Self::new(SandboxPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_writes_source_into_scratch() {
        let runner = SandboxRunner::default();
        let plan = runner
            .prepare(Language::Shell, "echo hi\n", &ResourceLimits::default())
            .unwrap();

        let written = std::fs::read_to_string(plan.scratch_path().join("main.sh")).unwrap();
        assert_eq!(written, "echo hi\n");
        assert_eq!(plan.steps().len(), 1);
        assert_eq!(plan.steps()[0].kind, StepKind::Execute);
    }

    #[test]
    fn test_rust_plan_compiles_first() {
        let runner = SandboxRunner::default();
        let plan = runner
            .prepare(Language::Rust, "fn main() {}", &ResourceLimits::default())
            .unwrap();

        assert!(plan.has_compile_step());
        let kinds: Vec<_> = plan.steps().iter().map(|s| s.kind).collect();
        assert_eq!(kinds, vec![StepKind::Compile, StepKind::Execute]);
    }

    #[test]
    fn test_scratch_removed_on_drop() {
        let runner = SandboxRunner::default();
        let plan = runner
            .prepare(Language::Python, "print(1)", &ResourceLimits::default())
            .unwrap();
        let path = plan.scratch_path().to_path_buf();
        assert!(path.exists());
        drop(plan);
        assert!(!path.exists());
    }

    #[test]
    fn test_scratch_root_is_used() {
        let root = tempfile::tempdir().unwrap();
        let policy = SandboxPolicy::default().with_scratch_root(root.path().join("runs"));
        let runner = SandboxRunner::new(policy);
        let plan = runner
            .prepare(Language::Node, "1", &ResourceLimits::default())
            .unwrap();
        assert!(plan.scratch_path().starts_with(root.path().join("runs")));
    }
}
