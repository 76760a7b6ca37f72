//! Patchwise reviewers.
//!
//! Language-model reviews of a patch: a commit message audit and an inline
//! code review. Replies are reflowed for mailing-list use and returned as
//! free text; splitting them into findings happens in `patchwise-ci`.

pub mod backend;
pub mod error;
pub mod format;
pub mod prompt;
pub mod reviewer;

pub use backend::{OpenAiBackend, ReviewBackend};
pub use error::ReviewError;
pub use format::{reflow, WRAP_WIDTH};
pub use prompt::{PromptTemplate, PromptValues, PLACEHOLDERS};
pub use reviewer::{build_context, ReviewExecutor, ReviewInput, Reviewer};

/// Result type for patchwise-review operations
pub type Result<T> = std::result::Result<T, ReviewError>;
