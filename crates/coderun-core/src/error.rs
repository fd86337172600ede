use thiserror::Error;

use crate::{SessionId, SessionState, WorkspaceId};

/// Synchronous rejection of a run request. No session exists afterwards.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("Workspace {workspace_id} already has an active run ({active})")]
    Busy {
        workspace_id: WorkspaceId,
        active: SessionId,
    },

    #[error("Unsupported language: {0}")]
    InvalidLanguage(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Sandbox unavailable: {0}")]
    SandboxUnavailable(String),
}

impl AdmissionError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            AdmissionError::Busy { .. } => "busy",
            AdmissionError::InvalidLanguage(_) => "invalid_language",
            AdmissionError::BadRequest(_) => "bad_request",
            AdmissionError::SandboxUnavailable(_) => "sandbox_unavailable",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CancelError {
    #[error("Session not found: {0}")]
    NotFound(SessionId),

    #[error("Session {id} already finished as {state}")]
    AlreadyTerminal { id: SessionId, state: SessionState },
}

impl CancelError {
    pub fn code(&self) -> &'static str {
        match self {
            CancelError::NotFound(_) => "not_found",
            CancelError::AlreadyTerminal { .. } => "already_terminal",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Session not found: {0}")]
    NotFound(SessionId),
}

/// Failure to write a run archive
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Failed to write archive: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode limits: {0}")]
    Encode(#[from] serde_json::Error),
}
