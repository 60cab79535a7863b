//! Error types for StoryCrew.
//!
//! Library crates use [`StoryCrewError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

use crate::types::JobStatus;

/// Top-level error type for all StoryCrew operations.
#[derive(Debug, thiserror::Error)]
pub enum StoryCrewError {
    /// Malformed or missing request fields; rejected before a job exists.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// The requested pipeline type is not registered.
    #[error("unknown pipeline type: {0}")]
    UnknownPipeline(String),

    /// No job with this ID is known.
    #[error("job not found: {0}")]
    NotFound(String),

    /// A job with this ID already exists in the registry.
    #[error("duplicate job id: {0}")]
    DuplicateId(String),

    /// The requested status change is not allowed by the job state machine.
    #[error("invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    /// An external collaborator stayed unreachable after the retry budget.
    #[error("{service} unavailable after {attempts} attempt(s): {message}")]
    ServiceConnection {
        service: String,
        attempts: u32,
        message: String,
    },

    /// A stage worker or postprocess step failed.
    #[error("pipeline execution failed: {0}")]
    PipelineExecution(String),

    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Durable queue / database error.
    #[error("storage error: {0}")]
    Storage(String),

    /// JSON encoding or decoding error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, StoryCrewError>;

impl StoryCrewError {
    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a pipeline execution error from any displayable message.
    pub fn pipeline(msg: impl Into<String>) -> Self {
        Self::PipelineExecution(msg.into())
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the error rejects a submission before any job is created.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Validation { .. } | Self::UnknownPipeline(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = StoryCrewError::validation("project_id must not be empty");
        assert_eq!(
            err.to_string(),
            "validation error: project_id must not be empty"
        );

        let err = StoryCrewError::UnknownPipeline("editor".into());
        assert!(err.to_string().contains("editor"));
    }

    #[test]
    fn transition_error_names_both_states() {
        let err = StoryCrewError::InvalidTransition {
            job_id: "architect_p1_1_0".into(),
            from: JobStatus::Completed,
            to: JobStatus::Running,
        };
        assert_eq!(
            err.to_string(),
            "invalid transition for job architect_p1_1_0: completed -> running"
        );
    }

    #[test]
    fn rejection_classification() {
        assert!(StoryCrewError::validation("x").is_rejection());
        assert!(StoryCrewError::UnknownPipeline("x".into()).is_rejection());
        assert!(!StoryCrewError::NotFound("x".into()).is_rejection());
        assert!(!StoryCrewError::pipeline("boom").is_rejection());
    }
}
