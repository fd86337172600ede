use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::SessionId;

/// Source of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Stdout,
    Stderr,
    Diagnostic,
    Lifecycle,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::Stdout => "stdout",
            EventKind::Stderr => "stderr",
            EventKind::Diagnostic => "diagnostic",
            EventKind::Lifecycle => "lifecycle",
        };
        f.write_str(s)
    }
}

/// One entry of a session's ordered event stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub session_id: SessionId,
    /// Starts at 1 and increases by exactly one per event
    pub seq: u64,
    pub kind: EventKind,
    pub payload: String,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn is_lifecycle(&self, marker: &LifecycleMarker) -> bool {
        self.kind == EventKind::Lifecycle && self.payload == marker.to_string()
    }
}

/// Synthetic events produced by the session driver rather than the program
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleMarker {
    Started,
    /// The compile step finished and the program is about to run
    Compiled,
    /// Output reached the byte cap; later output is discarded
    Truncated,
    MemoryLimitExceeded,
    TimedOut,
    Cancelled,
    InternalError(String),
    Exited(i32),
    Killed(i32),
}

impl LifecycleMarker {
    /// Whether this marker ends the stream
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LifecycleMarker::TimedOut
                | LifecycleMarker::Cancelled
                | LifecycleMarker::InternalError(_)
                | LifecycleMarker::Exited(_)
                | LifecycleMarker::Killed(_)
        )
    }
}

impl std::fmt::Display for LifecycleMarker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleMarker::Started => write!(f, "Started"),
            LifecycleMarker::Compiled => write!(f, "Compiled"),
            LifecycleMarker::Truncated => write!(f, "Truncated"),
            LifecycleMarker::MemoryLimitExceeded => write!(f, "MemoryLimitExceeded"),
            LifecycleMarker::TimedOut => write!(f, "TimedOut"),
            LifecycleMarker::Cancelled => write!(f, "Cancelled"),
            LifecycleMarker::InternalError(msg) => write!(f, "InternalError({})", msg),
            LifecycleMarker::Exited(code) => write!(f, "Exited({})", code),
            LifecycleMarker::Killed(signal) => write!(f, "Killed({})", signal),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_display() {
        assert_eq!(LifecycleMarker::Exited(0).to_string(), "Exited(0)");
        assert_eq!(LifecycleMarker::Killed(9).to_string(), "Killed(9)");
        assert_eq!(
            LifecycleMarker::InternalError("spawn failed".into()).to_string(),
            "InternalError(spawn failed)"
        );
    }

    #[test]
    fn test_terminal_markers() {
        assert!(LifecycleMarker::Exited(1).is_terminal());
        assert!(LifecycleMarker::TimedOut.is_terminal());
        assert!(!LifecycleMarker::Truncated.is_terminal());
        assert!(!LifecycleMarker::MemoryLimitExceeded.is_terminal());
    }
}
