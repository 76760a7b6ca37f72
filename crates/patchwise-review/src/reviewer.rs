//! Reviewer: turns a materialized patch into a prompt and a reply.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, instrument};

use patchwise_core::{git, PatchDiff, PatchReference, ReviewKind};

use crate::backend::ReviewBackend;
use crate::error::ReviewError;
use crate::format::{reflow, WRAP_WIDTH};
use crate::prompt::{
    PromptTemplate, PromptValues, CODE_REVIEW_PROMPT, COMMIT_AUDIT_PROMPT, SYSTEM_PROMPT,
};
use crate::Result;

/// Lines of surrounding code shown on each side of a hunk.
const CONTEXT_LINES: u32 = 10;
/// Regions separated by this many lines or fewer are merged.
const MAX_GAP: u32 = 5;
/// Upper bound on the context section, in bytes.
const MAX_CONTEXT_BYTES: usize = 64 * 1024;

const CODING_STYLE_PATH: &str = "Documentation/process/coding-style.rst";

/// Everything a reviewer needs to know about one patch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReviewInput {
    pub metadata: String,
    pub commit_text: String,
    pub diff: String,
    pub context: String,
    pub coding_style: String,
    /// Parsed `diff`, used to anchor quoted lines.
    pub parsed_diff: PatchDiff,
}

impl ReviewInput {
    /// Read the commit from the repository and surrounding code from the
    /// materialized tree at `tree_root`.
    pub async fn collect(tree_root: &Path, patch: &PatchReference) -> Result<Self> {
        let tree_root = tree_root.to_path_buf();
        let patch = patch.clone();
        tokio::task::spawn_blocking(move || Self::collect_blocking(&tree_root, &patch))
            .await
            .map_err(|e| ReviewError::Input(format!("input collection panicked: {e}")))?
    }

    fn collect_blocking(tree_root: &Path, patch: &PatchReference) -> Result<Self> {
        let repo = patch.repo_path.as_path();
        let commit_text = git::commit_message(repo, &patch.target_revision)?;
        let diff = git::diff(repo, patch)?;
        let author = git::author(repo, &patch.target_revision)?;
        let parsed_diff = PatchDiff::parse(&diff);

        let subject = commit_text.lines().next().unwrap_or_default();
        let metadata = format!(
            "Commit: {}\nAuthor: {}\nSubject: {}\nRange: {}\nFiles: {}",
            patch.target_revision,
            author,
            subject,
            patch.range(),
            parsed_diff.touched_files().join(", ")
        );

        let context = build_context(tree_root, &parsed_diff);
        let coding_style =
            std::fs::read_to_string(tree_root.join(CODING_STYLE_PATH)).unwrap_or_default();

        Ok(Self {
            metadata,
            commit_text,
            diff,
            context,
            coding_style,
            parsed_diff,
        })
    }

    fn values(&self) -> PromptValues {
        PromptValues {
            diff: self.diff.clone(),
            commit_text: self.commit_text.clone(),
            context: self.context.clone(),
            metadata: self.metadata.clone(),
            coding_style: self.coding_style.clone(),
        }
    }
}

/// Surrounding code for every modified file: each hunk widened by
/// [`CONTEXT_LINES`], nearby regions merged, gaps marked.
pub fn build_context(tree_root: &Path, diff: &PatchDiff) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut total = 0usize;

    for file in diff.files.iter().filter(|f| !f.deleted && !f.hunks.is_empty()) {
        let Ok(text) = std::fs::read_to_string(tree_root.join(&file.path)) else {
            continue;
        };
        let lines: Vec<&str> = text.lines().collect();
        let regions = merge_regions(
            file.hunks
                .iter()
                .map(|&(start, count)| {
                    (
                        start.saturating_sub(CONTEXT_LINES).max(1),
                        (start + count.max(1) - 1 + CONTEXT_LINES).min(lines.len() as u32),
                    )
                })
                .filter(|(a, b)| a <= b)
                .collect(),
        );
        if regions.is_empty() {
            continue;
        }

        let mut body = String::new();
        let mut previous_end = 0u32;
        for (start, end) in regions {
            if start > previous_end + 1 {
                body.push_str(&format!("// skipping lines {}-{}\n", previous_end + 1, start - 1));
            }
            for n in start..=end {
                body.push_str(lines[(n - 1) as usize]);
                body.push('\n');
            }
            previous_end = end;
        }
        if (previous_end as usize) < lines.len() {
            body.push_str(&format!(
                "// skipping lines {}-{}\n",
                previous_end + 1,
                lines.len()
            ));
        }

        let part = format!("{} (diff context):\n\n```\n{}```", file.path, body);
        total += part.len();
        if total > MAX_CONTEXT_BYTES {
            debug!(file = %file.path, "context budget exhausted, truncating");
            break;
        }
        parts.push(part);
    }
    parts.join("\n\n")
}

/// Merge inclusive `(start, end)` ranges closer than [`MAX_GAP`] lines.
fn merge_regions(mut regions: Vec<(u32, u32)>) -> Vec<(u32, u32)> {
    regions.sort_unstable();
    let mut merged: Vec<(u32, u32)> = Vec::new();
    for (start, end) in regions {
        match merged.last_mut() {
            Some(last) if start <= last.1 + MAX_GAP + 1 => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }
    merged
}

/// Runs one review of a materialized patch. The check runner only sees
/// this seam, so tests can substitute canned reviewers.
#[async_trait]
pub trait ReviewExecutor: Send + Sync {
    async fn review(
        &self,
        kind: ReviewKind,
        tree_root: &Path,
        patch: &PatchReference,
    ) -> Result<String>;
}

/// [`ReviewExecutor`] backed by a [`ReviewBackend`] and prompt templates.
pub struct Reviewer {
    backend: Arc<dyn ReviewBackend>,
    system: PromptTemplate,
    commit_audit: PromptTemplate,
    code_review: PromptTemplate,
}

impl Reviewer {
    /// Reviewer using the built-in prompts.
    pub fn new(backend: Arc<dyn ReviewBackend>) -> Result<Self> {
        Ok(Self {
            backend,
            system: PromptTemplate::new(SYSTEM_PROMPT)?,
            commit_audit: PromptTemplate::new(COMMIT_AUDIT_PROMPT)?,
            code_review: PromptTemplate::new(CODE_REVIEW_PROMPT)?,
        })
    }

    /// Replace a built-in prompt with the contents of `path`.
    pub fn with_template_file(mut self, kind: ReviewKind, path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ReviewError::Template(format!("cannot read {}: {e}", path.display())))?;
        let template = PromptTemplate::new(&text)?;
        match kind {
            ReviewKind::CommitAudit => self.commit_audit = template,
            ReviewKind::CodeReview => self.code_review = template,
        }
        Ok(self)
    }

    /// Render the system and user prompts for `kind`.
    pub fn prompts(&self, kind: ReviewKind, input: &ReviewInput) -> (Option<String>, String) {
        let values = input.values();
        let user = match kind {
            ReviewKind::CommitAudit => self.commit_audit.render(&values),
            ReviewKind::CodeReview => self.code_review.render(&values),
        };
        // The commit audit is about prose; the style guide only matters
        // for code.
        let system = match kind {
            ReviewKind::CommitAudit => None,
            ReviewKind::CodeReview => Some(self.system.render(&values)),
        };
        (system, user)
    }
}

#[async_trait]
impl ReviewExecutor for Reviewer {
    #[instrument(skip_all, fields(kind = kind.name(), backend = self.backend.name()))]
    async fn review(
        &self,
        kind: ReviewKind,
        tree_root: &Path,
        patch: &PatchReference,
    ) -> Result<String> {
        let input = ReviewInput::collect(tree_root, patch).await?;
        let (system, user) = self.prompts(kind, &input);
        debug!(prompt_bytes = user.len(), "requesting review");
        let reply = self.backend.complete(system.as_deref(), &user).await?;
        Ok(reflow(&reply, WRAP_WIDTH))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_regions() {
        assert_eq!(merge_regions(vec![(1, 5), (8, 10)]), vec![(1, 10)]);
        assert_eq!(merge_regions(vec![(20, 30), (1, 5)]), vec![(1, 5), (20, 30)]);
        assert_eq!(merge_regions(vec![(1, 10), (3, 4)]), vec![(1, 10)]);
    }

    #[test]
    fn test_build_context_marks_gaps() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("drivers")).unwrap();
        let source: String = (1..=100).map(|n| format!("line {n}\n")).collect();
        std::fs::write(dir.path().join("drivers/foo.c"), source).unwrap();

        let diff = PatchDiff::parse(
            "diff --git a/drivers/foo.c b/drivers/foo.c\n\
             --- a/drivers/foo.c\n\
             +++ b/drivers/foo.c\n\
             @@ -50,1 +50,1 @@\n\
             -old\n\
             +line 50\n",
        );
        let context = build_context(dir.path(), &diff);
        assert!(context.starts_with("drivers/foo.c (diff context):"));
        assert!(context.contains("// skipping lines 1-39\n"));
        assert!(context.contains("line 40\n"));
        assert!(context.contains("line 60\n"));
        assert!(!context.contains("line 61\n"));
        assert!(context.contains("// skipping lines 61-100\n"));
    }

    #[test]
    fn test_build_context_skips_missing_and_deleted_files() {
        let dir = tempfile::tempdir().unwrap();
        let diff = PatchDiff::parse(
            "diff --git a/gone.c b/gone.c\n\
             --- a/gone.c\n\
             +++ /dev/null\n\
             @@ -1 +0,0 @@\n\
             -x\n",
        );
        assert!(build_context(dir.path(), &diff).is_empty());
    }

    #[test]
    fn test_commit_audit_has_no_system_prompt() {
        struct Never;
        #[async_trait]
        impl ReviewBackend for Never {
            fn name(&self) -> &str {
                "never"
            }
            async fn complete(&self, _: Option<&str>, _: &str) -> Result<String> {
                Err(ReviewError::Unavailable("offline".into()))
            }
        }

        let reviewer = Reviewer::new(Arc::new(Never)).unwrap();
        let input = ReviewInput {
            commit_text: "foo: fix leak".to_string(),
            coding_style: "Use tabs.".to_string(),
            ..ReviewInput::default()
        };
        let (system, user) = reviewer.prompts(ReviewKind::CommitAudit, &input);
        assert!(system.is_none());
        assert!(user.contains("foo: fix leak"));

        let (system, _) = reviewer.prompts(ReviewKind::CodeReview, &input);
        assert!(system.unwrap().contains("Use tabs."));
    }
}
