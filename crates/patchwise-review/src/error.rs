//! Error types for patchwise-review

use patchwise_core::{CheckError, CheckErrorKind};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReviewError {
    /// No API key in config, flags or `OPENAI_API_KEY`
    #[error("no API key configured (set OPENAI_API_KEY or pass --api-key)")]
    MissingApiKey,

    /// Service unreachable, or retries exhausted
    #[error("review backend unavailable: {0}")]
    Unavailable(String),

    /// Non-retryable HTTP error
    #[error("review backend returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// The response had no usable completion
    #[error("invalid response from review backend: {0}")]
    InvalidResponse(String),

    /// A prompt template referenced an unknown placeholder
    #[error("invalid prompt template: {0}")]
    Template(String),

    /// Reading patch metadata or tree context failed
    #[error("failed to collect review input: {0}")]
    Input(String),
}

impl ReviewError {
    pub fn kind(&self) -> CheckErrorKind {
        match self {
            ReviewError::MissingApiKey | ReviewError::Unavailable(_) | ReviewError::Http { .. } => {
                CheckErrorKind::BackendUnavailable
            }
            ReviewError::InvalidResponse(_) => CheckErrorKind::ToolFailure,
            ReviewError::Template(_) | ReviewError::Input(_) => {
                CheckErrorKind::InfrastructureFailure
            }
        }
    }

    pub fn to_check_error(&self) -> CheckError {
        CheckError::new(self.kind(), self.to_string())
    }
}

impl From<patchwise_core::PatchwiseError> for ReviewError {
    fn from(err: patchwise_core::PatchwiseError) -> Self {
        ReviewError::Input(err.to_string())
    }
}
