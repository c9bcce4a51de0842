//! Command error types for clients of the command surface
//!
//! Provides structured, type-safe errors that serialize to `{"code": "...", "message": "..."}`.

use drawscan_core::jobs::SupervisorError;
use drawscan_core::storage::SessionError;
use serde::Serialize;

/// Errors returned by commands
///
/// Each variant serializes with a snake_case `code` field for client matching.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum CommandError {
    // Validation errors
    InvalidSession { message: String },
    InvalidContentHash { message: String },

    // Not found errors
    JobNotFound { message: String, job_id: String },

    // Operation errors
    StorageError { message: String },
    InternalError { message: String },
}

impl CommandError {
    pub fn invalid_session() -> Self {
        Self::InvalidSession {
            message: "Invalid session key".to_string(),
        }
    }

    pub fn invalid_content_hash() -> Self {
        Self::InvalidContentHash {
            message: "Invalid content hash".to_string(),
        }
    }

    pub fn job_not_found(job_id: impl Into<String>) -> Self {
        let job_id = job_id.into();
        Self::JobNotFound {
            message: format!("Job not found: {}", job_id),
            job_id,
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::StorageError {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidSession { message } => write!(f, "{}", message),
            Self::InvalidContentHash { message } => write!(f, "{}", message),
            Self::JobNotFound { message, .. } => write!(f, "{}", message),
            Self::StorageError { message } => write!(f, "{}", message),
            Self::InternalError { message } => write!(f, "{}", message),
        }
    }
}

impl std::error::Error for CommandError {}

impl From<SupervisorError> for CommandError {
    fn from(err: SupervisorError) -> Self {
        match err {
            SupervisorError::Session(SessionError::InvalidKey) => Self::invalid_session(),
            SupervisorError::Session(e) => Self::storage(e.to_string()),
            SupervisorError::InvalidContentHash => Self::invalid_content_hash(),
        }
    }
}

impl From<anyhow::Error> for CommandError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(err.to_string())
    }
}

impl From<std::io::Error> for CommandError {
    fn from(err: std::io::Error) -> Self {
        Self::storage(err.to_string())
    }
}

/// Result type alias for commands
pub type CommandResult<T> = Result<T, CommandError>;
