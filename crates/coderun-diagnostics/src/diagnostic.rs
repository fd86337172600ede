use serde::{Deserialize, Serialize};

/// How serious a reported problem is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
        }
    }
}

/// A single structured problem extracted from tool output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    /// Path as reported by the tool, relative to the scratch root when possible
    pub file: Option<String>,
    pub line: Option<u32>,
    #[serde(rename = "col")]
    pub column: Option<u32>,
}

impl Diagnostic {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            file: None,
            line: None,
            column: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Severity::Error, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, message)
    }

    pub fn with_location(mut self, location: Location) -> Self {
        self.file = location.file;
        self.line = location.line;
        self.column = location.column;
        self
    }

    pub fn has_location(&self) -> bool {
        self.line.is_some()
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }

    /// `file:line:col` when known, for compact rendering
    pub fn location_label(&self) -> Option<String> {
        let file = self.file.as_deref().unwrap_or("<unknown>");
        match (self.line, self.column) {
            (Some(line), Some(col)) => Some(format!("{}:{}:{}", file, line, col)),
            (Some(line), None) => Some(format!("{}:{}", file, line)),
            _ => self.file.clone(),
        }
    }
}

/// Source position carried between lines while a diagnostic is assembled
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Location {
    pub file: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

impl Location {
    pub fn new(file: Option<String>, line: Option<u32>, column: Option<u32>) -> Self {
        Self { file, line, column }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_column_as_col() {
        let diagnostic = Diagnostic::error("boom").with_location(Location::new(
            Some("main.js".into()),
            Some(3),
            Some(7),
        ));
        let json = serde_json::to_value(&diagnostic).unwrap();
        assert_eq!(json["severity"], "error");
        assert_eq!(json["col"], 7);
        assert_eq!(json["line"], 3);
    }

    #[test]
    fn test_location_label() {
        let d = Diagnostic::warning("w").with_location(Location::new(
            Some("a.py".into()),
            Some(2),
            None,
        ));
        assert_eq!(d.location_label().as_deref(), Some("a.py:2"));
        assert_eq!(Diagnostic::error("e").location_label(), None);
    }
}
