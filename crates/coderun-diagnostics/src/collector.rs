use std::path::{Path, PathBuf};

use coderun_sandbox::Language;
use regex::Captures;
use tracing::trace;

use crate::diagnostic::{Diagnostic, Location, Severity};
use crate::rules::*;

/// What a half-built diagnostic is still waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Awaiting {
    /// A stack frame or `-->` line that carries the position
    Location,
    /// The message line that follows a rust panic header
    Message,
}

#[derive(Debug)]
struct Pending {
    diagnostic: Diagnostic,
    awaiting: Awaiting,
}

/// Streaming extractor for one run's stderr / compiler output.
///
/// Lines are fed one at a time with [`push`](Self::push) as they arrive;
/// diagnostics whose location spans several lines are held back until the
/// location shows up or the next unrelated line arrives. Call
/// [`finish`](Self::finish) once the stream ends to flush anything held back.
#[derive(Debug)]
pub struct DiagnosticsCollector {
    language: Language,
    root: Option<PathBuf>,
    pending: Option<Pending>,
    location: Option<Location>,
}

impl DiagnosticsCollector {
    pub fn new(language: Language) -> Self {
        Self {
            language,
            root: None,
            pending: None,
            location: None,
        }
    }

    /// Report file paths relative to `root` (the run's scratch directory)
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn language(&self) -> Language {
        self.language
    }

    /// Feed one line of output, returning every diagnostic it completed
    pub fn push(&mut self, line: &str) -> Vec<Diagnostic> {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut out = Vec::new();

        if self.awaiting() == Some(Awaiting::Message) {
            if line.trim().is_empty() {
                return out;
            }
            if let Some(mut pending) = self.pending.take() {
                pending.diagnostic.message = line.trim().to_string();
                out.push(pending.diagnostic);
            }
            return out;
        }

        if let Some(diagnostic) = self.shared_rules(line) {
            self.flush_into(&mut out);
            out.push(diagnostic);
            return out;
        }

        match self.language {
            Language::Node => self.push_node(line, &mut out),
            Language::Python => self.push_python(line, &mut out),
            Language::Shell => self.push_shell(line, &mut out),
            Language::Rust => self.push_rust(line, &mut out),
        }

        if !out.is_empty() {
            trace!(count = out.len(), language = %self.language, "Extracted diagnostics");
        }
        out
    }

    /// Flush a diagnostic still waiting for more lines
    pub fn finish(&mut self) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        self.flush_into(&mut out);
        self.location = None;
        out
    }

    fn awaiting(&self) -> Option<Awaiting> {
        self.pending.as_ref().map(|p| p.awaiting)
    }

    fn flush_into(&mut self, out: &mut Vec<Diagnostic>) {
        if let Some(pending) = self.pending.take() {
            out.push(pending.diagnostic);
        }
    }

    fn hold(&mut self, diagnostic: Diagnostic, awaiting: Awaiting) {
        self.pending = Some(Pending {
            diagnostic,
            awaiting,
        });
    }

    fn shared_rules(&self, line: &str) -> Option<Diagnostic> {
        if let Some(caps) = GCC_STYLE.captures(line) {
            let diagnostic = Diagnostic::new(severity_of(&caps["sev"]), caps["msg"].trim());
            return Some(diagnostic.with_location(self.location_from(&caps)));
        }
        if let Some(caps) = TSC_STYLE.captures(line) {
            let message = format!("{}: {}", &caps["code"], caps["msg"].trim());
            let diagnostic = Diagnostic::new(severity_of(&caps["sev"]), message);
            return Some(diagnostic.with_location(self.location_from(&caps)));
        }
        None
    }

    fn push_node(&mut self, line: &str, out: &mut Vec<Diagnostic>) {
        if let Some(caps) = NODE_FRAME.captures(line) {
            let file = &caps["file"];
            if file.starts_with("node:") || file.starts_with("internal/") {
                return;
            }
            if self.awaiting() == Some(Awaiting::Location) {
                let frame = self.location_from(&caps);
                if let Some(mut pending) = self.pending.take() {
                    let d = &mut pending.diagnostic;
                    if !d.has_location() {
                        *d = d.clone().with_location(frame);
                    } else if d.file == frame.file && d.line == frame.line && d.column.is_none() {
                        d.column = frame.column;
                    }
                    out.push(pending.diagnostic);
                }
            }
            return;
        }

        if let Some(caps) = NODE_HEADER.captures(line) {
            self.flush_into(out);
            self.location = Some(self.location_from(&caps));
            return;
        }

        if let Some(caps) = NODE_WARNING.captures(line) {
            self.flush_into(out);
            let message = format!("{}: {}", &caps["kind"], caps["msg"].trim());
            out.push(Diagnostic::warning(message));
            return;
        }

        if let Some(caps) = NODE_ERROR.captures(line) {
            self.flush_into(out);
            let kind = &caps["kind"];
            let raw = caps["msg"].trim();

            if let Some(trailing) = TRAILING_LINE.captures(raw) {
                let location = Location::new(
                    self.location.take().and_then(|l| l.file),
                    parse_number(trailing.name("line").map(|m| m.as_str())),
                    parse_number(trailing.name("col").map(|m| m.as_str())),
                );
                let message = format!("{}: {}", kind, trailing["msg"].trim());
                out.push(Diagnostic::error(message).with_location(location));
                return;
            }

            let mut diagnostic = Diagnostic::error(join_kind(kind, raw));
            if let Some(location) = self.location.take() {
                diagnostic = diagnostic.with_location(location);
            }
            self.hold(diagnostic, Awaiting::Location);
            return;
        }

        if !line.trim().is_empty() {
            self.flush_into(out);
        }
    }

    fn push_python(&mut self, line: &str, out: &mut Vec<Diagnostic>) {
        if let Some(caps) = PY_WARNING.captures(line) {
            let message = format!("{}: {}", &caps["kind"], caps["msg"].trim());
            let location = self.location_from(&caps);
            out.push(Diagnostic::warning(message).with_location(location));
            return;
        }

        if let Some(caps) = PY_FRAME.captures(line) {
            self.location = Some(self.location_from(&caps));
            return;
        }

        if let Some(caps) = PY_EXCEPTION.captures(line) {
            let kind = &caps["kind"];
            let raw = caps.name("msg").map(|m| m.as_str().trim()).unwrap_or("");
            let severity = if kind.ends_with("Warning") {
                Severity::Warning
            } else {
                Severity::Error
            };
            let mut diagnostic = Diagnostic::new(severity, join_kind(kind, raw));
            if let Some(location) = self.location.take() {
                diagnostic = diagnostic.with_location(location);
            }
            out.push(diagnostic);
        }
    }

    fn push_shell(&mut self, line: &str, out: &mut Vec<Diagnostic>) {
        let caps = BASH_ERROR
            .captures(line)
            .or_else(|| DASH_ERROR.captures(line));
        if let Some(caps) = caps {
            let location = self.location_from(&caps);
            out.push(Diagnostic::error(caps["msg"].trim()).with_location(location));
        }
    }

    fn push_rust(&mut self, line: &str, out: &mut Vec<Diagnostic>) {
        if let Some(caps) = RUST_LOCATION.captures(line) {
            if self.awaiting() == Some(Awaiting::Location) {
                let location = self.location_from(&caps);
                if let Some(pending) = self.pending.take() {
                    out.push(pending.diagnostic.with_location(location));
                }
            }
            return;
        }

        if let Some(caps) = RUST_HEADLINE.captures(line) {
            self.flush_into(out);
            let raw = caps["msg"].trim();
            if RUST_SUMMARY.is_match(raw) {
                return;
            }
            let message = match caps.name("code") {
                Some(code) => format!("{}: {}", code.as_str(), raw),
                None => raw.to_string(),
            };
            self.hold(
                Diagnostic::new(severity_of(&caps["sev"]), message),
                Awaiting::Location,
            );
            return;
        }

        if let Some(caps) = RUST_PANIC_LEGACY.captures(line) {
            self.flush_into(out);
            let location = self.location_from(&caps);
            let message = format!("panicked: {}", &caps["msg"]);
            out.push(Diagnostic::error(message).with_location(location));
            return;
        }

        if let Some(caps) = RUST_PANIC.captures(line) {
            self.flush_into(out);
            let location = self.location_from(&caps);
            self.hold(
                Diagnostic::error("panicked").with_location(location),
                Awaiting::Message,
            );
        }
    }

    fn location_from(&self, caps: &Captures<'_>) -> Location {
        Location::new(
            caps.name("file").map(|m| self.display_path(m.as_str())),
            parse_number(caps.name("line").map(|m| m.as_str())),
            parse_number(caps.name("col").map(|m| m.as_str())),
        )
    }

    fn display_path(&self, raw: &str) -> String {
        let raw = raw.strip_prefix("file://").unwrap_or(raw);
        if let Some(root) = &self.root {
            if let Ok(relative) = Path::new(raw).strip_prefix(root) {
                return relative.to_string_lossy().to_string();
            }
        }
        raw.to_string()
    }
}

/// Extract every diagnostic from a complete sequence of output lines
pub fn extract<'a, I>(language: Language, lines: I) -> Vec<Diagnostic>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut collector = DiagnosticsCollector::new(language);
    let mut diagnostics = Vec::new();
    for line in lines {
        diagnostics.extend(collector.push(line));
    }
    diagnostics.extend(collector.finish());
    diagnostics
}

fn severity_of(raw: &str) -> Severity {
    if raw.eq_ignore_ascii_case("warning") {
        Severity::Warning
    } else {
        Severity::Error
    }
}

fn join_kind(kind: &str, message: &str) -> String {
    if message.is_empty() {
        kind.to_string()
    } else {
        format!("{}: {}", kind, message)
    }
}

fn parse_number(raw: Option<&str>) -> Option<u32> {
    raw.and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_error_with_trailing_line() {
        let diagnostics = extract(Language::Node, ["TypeError: x is not defined at line 3"]);
        assert_eq!(diagnostics.len(), 1);
        let d = &diagnostics[0];
        assert_eq!(d.severity, Severity::Error);
        assert_eq!(d.line, Some(3));
        assert_eq!(d.message, "TypeError: x is not defined");
    }

    #[test]
    fn test_node_uncaught_exception_uses_header_and_frame() {
        let output = [
            "/tmp/coderun-abc/main.js:3",
            "console.log(x);",
            "            ^",
            "",
            "ReferenceError: x is not defined",
            "    at Object.<anonymous> (/tmp/coderun-abc/main.js:3:13)",
            "    at Module._compile (node:internal/modules/cjs/loader:1256:14)",
            "",
            "Node.js v20.11.0",
        ];
        let mut collector = DiagnosticsCollector::new(Language::Node).with_root("/tmp/coderun-abc");
        let mut diagnostics = Vec::new();
        for line in output {
            diagnostics.extend(collector.push(line));
        }
        diagnostics.extend(collector.finish());

        assert_eq!(diagnostics.len(), 1);
        let d = &diagnostics[0];
        assert_eq!(d.message, "ReferenceError: x is not defined");
        assert_eq!(d.file.as_deref(), Some("main.js"));
        assert_eq!(d.line, Some(3));
        assert_eq!(d.column, Some(13));
    }

    #[test]
    fn test_node_error_without_location_is_flushed_on_finish() {
        let mut collector = DiagnosticsCollector::new(Language::Node);
        assert!(collector.push("Error: Cannot find module './routes/auth'").is_empty());
        let flushed = collector.finish();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].message, "Error: Cannot find module './routes/auth'");
        assert_eq!(flushed[0].line, None);
    }

    #[test]
    fn test_node_process_warning() {
        let diagnostics = extract(
            Language::Node,
            ["(node:4242) [DEP0005] DeprecationWarning: Buffer() is deprecated"],
        );
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].severity, Severity::Warning);
    }

    #[test]
    fn test_python_traceback_uses_innermost_frame() {
        let output = [
            "Traceback (most recent call last):",
            "  File \"/tmp/run/main.py\", line 7, in <module>",
            "    main()",
            "  File \"/tmp/run/main.py\", line 4, in main",
            "    print(1 / 0)",
            "ZeroDivisionError: division by zero",
        ];
        let diagnostics = extract(Language::Python, output);
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].message, "ZeroDivisionError: division by zero");
        assert_eq!(diagnostics[0].line, Some(4));
        assert_eq!(diagnostics[0].file.as_deref(), Some("/tmp/run/main.py"));
    }

    #[test]
    fn test_python_warning_line() {
        let diagnostics = extract(
            Language::Python,
            ["main.py:3: UserWarning: careful now", "  warnings.warn(\"careful now\")"],
        );
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].severity, Severity::Warning);
        assert_eq!(diagnostics[0].line, Some(3));
    }

    #[test]
    fn test_shell_bash_and_dash() {
        let diagnostics = extract(
            Language::Shell,
            [
                "main.sh: line 2: foo: command not found",
                "main.sh: 5: bar: not found",
                "plain output that means nothing",
            ],
        );
        assert_eq!(diagnostics.len(), 2);
        assert_eq!(diagnostics[0].line, Some(2));
        assert_eq!(diagnostics[0].message, "foo: command not found");
        assert_eq!(diagnostics[1].line, Some(5));
    }

    #[test]
    fn test_rustc_errors_and_summary() {
        let output = [
            "error[E0425]: cannot find value `x` in this scope",
            " --> main.rs:2:20",
            "  |",
            "2 |     println!(\"{}\", x);",
            "  |                    ^ not found in this scope",
            "",
            "warning: unused variable: `y`",
            " --> main.rs:3:9",
            "",
            "error: aborting due to 1 previous error",
        ];
        let diagnostics = extract(Language::Rust, output);
        assert_eq!(diagnostics.len(), 2);
        assert_eq!(diagnostics[0].message, "E0425: cannot find value `x` in this scope");
        assert_eq!(diagnostics[0].column, Some(20));
        assert_eq!(diagnostics[1].severity, Severity::Warning);
        assert_eq!(diagnostics[1].line, Some(3));
    }

    #[test]
    fn test_rust_panic_message_on_next_line() {
        let diagnostics = extract(
            Language::Rust,
            [
                "thread 'main' panicked at main.rs:4:5:",
                "attempt to divide by zero",
                "note: run with `RUST_BACKTRACE=1` environment variable to display a backtrace",
            ],
        );
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].message, "attempt to divide by zero");
        assert_eq!(diagnostics[0].line, Some(4));
    }

    #[test]
    fn test_shared_tsc_rule_applies_to_any_language() {
        let diagnostics = extract(
            Language::Node,
            ["src/index.ts(2,30): error TS2307: Cannot find module './routes/auth'"],
        );
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].file.as_deref(), Some("src/index.ts"));
        assert_eq!(diagnostics[0].column, Some(30));
        assert_eq!(
            diagnostics[0].message,
            "TS2307: Cannot find module './routes/auth'"
        );
    }

    #[test]
    fn test_garbage_is_ignored() {
        let diagnostics = extract(Language::Python, ["", "   ", "\u{1b}[31mweird\u{1b}[0m", "::::"]);
        assert!(diagnostics.is_empty());
    }
}
