//! Error taxonomy for patchwise.
//!
//! Two layers:
//! - [`CheckError`] / [`CheckErrorKind`]: everything that can go wrong while
//!   running one check. These are captured into that check's outcome and
//!   never abort sibling checks.
//! - [`PatchwiseError`]: run-fatal bootstrap failures (bad patch reference,
//!   invalid check configuration). These abort before any check starts.

use serde::{Deserialize, Serialize};

/// Kind of a per-check failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CheckErrorKind {
    /// The environment image or toolchain could not be built or fetched.
    EnvironmentUnavailable,
    /// The target revision is absent from the repository history.
    RevisionNotFound,
    /// The worktree could not be brought to a pristine state.
    DirtyStateError,
    /// The tool exited non-zero without recoverable output.
    ToolFailure,
    /// Provisioning or spawn error before the tool ran.
    InfrastructureFailure,
    /// The check exceeded its timeout.
    TimedOut,
    /// Some tool output could not be parsed (non-fatal).
    ParseWarning,
    /// The AI review service was unreachable.
    BackendUnavailable,
    /// The run was cancelled before the check finished.
    Cancelled,
}

impl CheckErrorKind {
    /// Stable snake_case name, as used in reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckErrorKind::EnvironmentUnavailable => "environment_unavailable",
            CheckErrorKind::RevisionNotFound => "revision_not_found",
            CheckErrorKind::DirtyStateError => "dirty_state_error",
            CheckErrorKind::ToolFailure => "tool_failure",
            CheckErrorKind::InfrastructureFailure => "infrastructure_failure",
            CheckErrorKind::TimedOut => "timed_out",
            CheckErrorKind::ParseWarning => "parse_warning",
            CheckErrorKind::BackendUnavailable => "backend_unavailable",
            CheckErrorKind::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for CheckErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A per-check failure with enough detail to tell infrastructure problems
/// apart from genuine findings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct CheckError {
    pub kind: CheckErrorKind,
    pub message: String,
}

impl CheckError {
    pub fn new(kind: CheckErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Run-fatal errors.
#[derive(Debug, thiserror::Error)]
pub enum PatchwiseError {
    #[error("invalid patch reference: {0}")]
    InvalidPatchReference(String),

    #[error("invalid check '{check}': {reason}")]
    InvalidCheckSpec { check: String, reason: String },

    #[error("check '{0}' is configured more than once")]
    DuplicateCheck(String),

    #[error("unknown check: {0}")]
    UnknownCheck(String),

    #[error("no checks selected")]
    NoChecks,

    #[error("git error: {0}")]
    GitError(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for patchwise bootstrap operations.
pub type Result<T> = std::result::Result<T, PatchwiseError>;
