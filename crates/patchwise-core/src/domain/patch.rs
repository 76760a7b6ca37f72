//! Patch identity.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::domain::error::{PatchwiseError, Result};

/// Identifies the change under review: where the source tree lives, the
/// revision it applies on, and the proposed commit.
///
/// Immutable once a run starts; the scheduler shares it behind an `Arc`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PatchReference {
    /// Path of the repository holding both revisions.
    pub repo_path: PathBuf,

    /// Revision the patch applies on (usually the commit's parent).
    pub base_revision: String,

    /// Proposed commit to check out.
    pub target_revision: String,
}

impl PatchReference {
    /// Create a validated patch reference.
    pub fn new(
        repo_path: impl Into<PathBuf>,
        base_revision: impl Into<String>,
        target_revision: impl Into<String>,
    ) -> Result<Self> {
        let patch = Self {
            repo_path: repo_path.into(),
            base_revision: base_revision.into().trim().to_string(),
            target_revision: target_revision.into().trim().to_string(),
        };
        patch.validate()?;
        Ok(patch)
    }

    /// Check the reference is usable. Deserialized references skip `new`,
    /// so the scheduler calls this again before fanning out.
    pub fn validate(&self) -> Result<()> {
        if self.repo_path.as_os_str().is_empty() {
            return Err(PatchwiseError::InvalidPatchReference(
                "repository path is empty".to_string(),
            ));
        }
        if self.base_revision.is_empty() {
            return Err(PatchwiseError::InvalidPatchReference(
                "base revision is empty".to_string(),
            ));
        }
        if self.target_revision.is_empty() {
            return Err(PatchwiseError::InvalidPatchReference(
                "target revision is empty".to_string(),
            ));
        }
        if self.base_revision == self.target_revision {
            return Err(PatchwiseError::InvalidPatchReference(format!(
                "base and target are the same revision ({})",
                self.target_revision
            )));
        }
        Ok(())
    }

    /// `base..target`, as accepted by `git log` and `git diff`.
    pub fn range(&self) -> String {
        format!("{}..{}", self.base_revision, self.target_revision)
    }

    /// First 12 characters of the target revision.
    pub fn short_target(&self) -> &str {
        &self.target_revision[..12.min(self.target_revision.len())]
    }
}

impl std::fmt::Display for PatchReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.range(), self.repo_path.display())
    }
}
