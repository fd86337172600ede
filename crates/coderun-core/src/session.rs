use chrono::{DateTime, Utc};
use coderun_sandbox::{Language, ResourceLimits};
use serde::{Deserialize, Serialize};

use crate::{SessionId, WorkspaceId};

/// Lifecycle state of a session. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Succeeded
                | SessionState::Failed
                | SessionState::Cancelled
                | SessionState::TimedOut
        )
    }

    /// Queued or running; at most one per workspace
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Process exit code conventionally reported for this state
    pub fn cli_exit_code(&self) -> i32 {
        match self {
            SessionState::Succeeded => 0,
            SessionState::Failed => 1,
            SessionState::Cancelled => 130,
            SessionState::TimedOut => 124,
            SessionState::Queued | SessionState::Running => 2,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            SessionState::Queued => 0,
            SessionState::Running => 1,
            _ => 2,
        }
    }

    /// Whether moving from `self` to `next` is allowed
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        next.rank() > self.rank()
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Queued => "queued",
            SessionState::Running => "running",
            SessionState::Succeeded => "succeeded",
            SessionState::Failed => "failed",
            SessionState::Cancelled => "cancelled",
            SessionState::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

/// Why a session ended in `Failed` or `TimedOut`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    NonZeroExit,
    Signal,
    MemoryLimit,
    Timeout,
    Internal,
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureCause::NonZeroExit => "non_zero_exit",
            FailureCause::Signal => "signal",
            FailureCause::MemoryLimit => "memory_limit",
            FailureCause::Timeout => "timeout",
            FailureCause::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// One execution request and its progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub workspace_id: WorkspaceId,
    pub language: Language,
    pub source: String,
    pub state: SessionState,
    pub failure: Option<FailureCause>,
    pub limits: ResourceLimits,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
}

impl Session {
    pub(crate) fn queued(
        workspace_id: WorkspaceId,
        language: Language,
        source: String,
        limits: ResourceLimits,
    ) -> Self {
        Self {
            id: SessionId::new(),
            workspace_id,
            language,
            source,
            state: SessionState::Queued,
            failure: None,
            limits,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            exit_code: None,
        }
    }

    /// Wall-clock time between start and end, if both are known
    pub fn duration_secs(&self) -> Option<f64> {
        let start = self.started_at?;
        let end = self.ended_at?;
        Some((end - start).num_milliseconds() as f64 / 1000.0)
    }

    pub fn summary(&self, problems: usize) -> SessionSummary {
        SessionSummary {
            id: self.id,
            workspace_id: self.workspace_id.clone(),
            language: self.language,
            state: self.state,
            failure: self.failure,
            exit_code: self.exit_code,
            created_at: self.created_at,
            started_at: self.started_at,
            ended_at: self.ended_at,
            problems,
        }
    }
}

/// Lightweight view of a session for listings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: SessionId,
    pub workspace_id: WorkspaceId,
    pub language: Language,
    pub state: SessionState,
    pub failure: Option<FailureCause>,
    pub exit_code: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub problems: usize,
}

/// Registry-wide change notifications
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionUpdate {
    Created {
        session: SessionSummary,
    },
    StateChanged {
        session_id: SessionId,
        state: SessionState,
    },
    Completed {
        session: SessionSummary,
    },
}

impl SessionUpdate {
    pub fn session_id(&self) -> SessionId {
        match self {
            SessionUpdate::Created { session } | SessionUpdate::Completed { session } => session.id,
            SessionUpdate::StateChanged { session_id, .. } => *session_id,
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            SessionUpdate::Created { .. } => "session_created",
            SessionUpdate::StateChanged { .. } => "session_updated",
            SessionUpdate::Completed { .. } => "session_completed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_are_monotonic() {
        use SessionState::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Queued.can_transition_to(Failed));
        assert!(Running.can_transition_to(TimedOut));
        assert!(!Running.can_transition_to(Queued));
        assert!(!Succeeded.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Running));
        assert!(!Running.can_transition_to(Running));
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&SessionState::TimedOut).unwrap();
        assert_eq!(json, "\"timed_out\"");
        assert_eq!(SessionState::TimedOut.to_string(), "timed_out");
    }
}
