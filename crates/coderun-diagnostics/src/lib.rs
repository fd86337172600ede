//! # coderun-diagnostics
//!
//! Turns compiler and runtime output into structured problems.
//!
//! Each supported [`Language`](coderun_sandbox::Language) has its own set of
//! line rules (tracebacks, stack frames, `-->` locations); gcc-style and
//! tsc-style lines are recognised for every language. Extraction is best
//! effort: lines that match nothing are skipped and never produce an error.
//!
//! ## Key Types
//!
//! - [`DiagnosticsCollector`] - Streaming extractor fed one line at a time
//! - [`Diagnostic`] - A single problem with optional file/line/column
//! - [`extract`] - One-shot extraction over a complete set of lines

mod collector;
mod diagnostic;
pub mod rules;

pub use collector::{extract, DiagnosticsCollector};
pub use diagnostic::{Diagnostic, Location, Severity};
