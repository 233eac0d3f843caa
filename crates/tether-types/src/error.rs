//! Error taxonomy shared by the terminal registry, the session directory and
//! the gateway.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TetherError>;

#[derive(Debug, Error)]
pub enum TetherError {
    /// Unknown terminal or session id.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Caller does not own the resource.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The multiplexer binary is missing.
    #[error("terminal multiplexer unavailable: {0}")]
    ExternalToolUnavailable(String),

    /// A multiplexer call timed out or exited non-zero.
    #[error("external call failed: {0}")]
    ExternalCallFailed(String),

    #[error("terminal {0} has exited")]
    ProcessExited(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TetherError {
    pub fn terminal_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "terminal",
            id: id.into(),
        }
    }

    pub fn session_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "session",
            id: id.into(),
        }
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn external(msg: impl Into<String>) -> Self {
        Self::ExternalCallFailed(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Stable machine-readable code sent to clients alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::ExternalToolUnavailable(_) => "TOOL_UNAVAILABLE",
            Self::ExternalCallFailed(_) => "EXTERNAL_CALL_FAILED",
            Self::ProcessExited(_) => "PROCESS_EXITED",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Io(_) => "IO_ERROR",
        }
    }
}

impl From<serde_json::Error> for TetherError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(err.to_string())
    }
}
