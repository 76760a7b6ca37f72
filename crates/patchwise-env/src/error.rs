//! Error types for patchwise-env

use patchwise_core::{CheckError, CheckErrorKind};
use thiserror::Error;

/// Errors raised while providing environments or materializing trees.
#[derive(Error, Debug)]
pub enum EnvError {
    /// Docker binary not found or daemon unreachable
    #[error("docker is not available: {0}")]
    DockerUnavailable(String),

    /// An environment's image could not be built
    #[error("failed to build environment '{environment}': {reason}")]
    BuildFailed { environment: String, reason: String },

    /// A tool the environment needs is missing from the host
    #[error("environment '{environment}' requires '{tool}', which is not in PATH")]
    MissingTool { environment: String, tool: String },

    /// A container or host command failed
    #[error("command failed: {0}")]
    CommandFailed(String),

    /// Target revision is not in the repository
    #[error("revision not found: {0}")]
    RevisionNotFound(String),

    /// Worktree could not be made pristine
    #[error("worktree is not clean: {0}")]
    DirtyState(String),

    /// Git invocation failed
    #[error("git error: {0}")]
    Git(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EnvError {
    /// Per-check error kind this failure is reported as.
    pub fn kind(&self) -> CheckErrorKind {
        match self {
            EnvError::DockerUnavailable(_)
            | EnvError::BuildFailed { .. }
            | EnvError::MissingTool { .. } => CheckErrorKind::EnvironmentUnavailable,
            EnvError::RevisionNotFound(_) => CheckErrorKind::RevisionNotFound,
            EnvError::DirtyState(_) => CheckErrorKind::DirtyStateError,
            EnvError::CommandFailed(_) | EnvError::Git(_) | EnvError::Io(_) | EnvError::Json(_) => {
                CheckErrorKind::InfrastructureFailure
            }
        }
    }

    pub fn to_check_error(&self) -> CheckError {
        CheckError::new(self.kind(), self.to_string())
    }
}
