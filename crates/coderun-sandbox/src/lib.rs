//! Sandboxed execution of untrusted source code.
//!
//! A [`SandboxRunner`] writes submitted source into a private scratch
//! directory, resolves the toolchain commands for its language, and spawns
//! each step as a [`SandboxProcess`] under resource limits. Output is
//! delivered line by line over an mpsc channel.

mod limits;
mod node;
mod output;
mod policy;
mod process;
mod python;
mod runner;
mod rust;
mod shell;
mod traits;

use std::path::PathBuf;

pub use limits::{LimitOverrides, ResourceLimits};
pub use node::NodeToolchain;
pub use output::{OutputChunk, StreamKind, MAX_LINE_BYTES};
pub use policy::{IsolationMode, SandboxPolicy};
pub use process::{exit_signal, shell_exit_code, SandboxProcess, Termination};
pub use python::PythonToolchain;
pub use runner::{PlannedStep, RunPlan, SandboxRunner};
pub use rust::RustToolchain;
pub use shell::ShellToolchain;
pub use traits::{CommandSpec, Language, MemoryStrategy, SandboxError, StepKind, Toolchain};

/// Create the toolchain for a language, optionally at a custom binary path
pub fn create_toolchain(language: Language, binary_path: Option<PathBuf>) -> Box<dyn Toolchain> {
    match (language, binary_path) {
        (Language::Node, None) => Box::new(NodeToolchain::new()),
        (Language::Node, Some(path)) => Box::new(NodeToolchain::with_binary_path(path)),
        (Language::Python, None) => Box::new(PythonToolchain::new()),
        (Language::Python, Some(path)) => Box::new(PythonToolchain::with_binary_path(path)),
        (Language::Shell, None) => Box::new(ShellToolchain::new()),
        (Language::Shell, Some(path)) => Box::new(ShellToolchain::with_binary_path(path)),
        (Language::Rust, None) => Box::new(RustToolchain::new()),
        (Language::Rust, Some(path)) => Box::new(RustToolchain::with_binary_path(path)),
    }
}
