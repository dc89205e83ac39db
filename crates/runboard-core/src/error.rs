use thiserror::Error;

use crate::session::SessionId;

/// Errors produced by the session core.
#[derive(Debug, Error)]
pub enum RunboardError {
    #[error("script not found: {0}")]
    ScriptNotFound(String),

    #[error("workspace directory not found: {0}")]
    WorkspaceNotFound(String),

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("failed to start process: {0}")]
    Spawn(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl RunboardError {
    /// Whether the error means the caller addressed something that does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RunboardError::ScriptNotFound(_)
                | RunboardError::WorkspaceNotFound(_)
                | RunboardError::SessionNotFound(_)
        )
    }
}

pub type RunboardResult<T> = Result<T, RunboardError>;
