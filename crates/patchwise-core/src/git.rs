//! Git plumbing for reading patch metadata from a repository.

use std::path::Path;
use std::process::Command;

use crate::domain::error::{PatchwiseError, Result};
use crate::domain::patch::PatchReference;

/// Run `git <args>` in `repo_dir` and return trimmed-right stdout.
fn git_output(repo_dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo_dir)
        .output()
        .map_err(|e| PatchwiseError::GitError(format!("failed to run git: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PatchwiseError::GitError(format!(
            "git {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout)
        .trim_end()
        .to_string())
}

/// Resolve a revision expression (`HEAD`, a branch, a short SHA) to the
/// full commit SHA.
pub fn resolve_revision(repo_dir: &Path, rev: &str) -> Result<String> {
    let spec = format!("{rev}^{{commit}}");
    let sha = git_output(repo_dir, &["rev-parse", "--verify", "--quiet", spec.as_str()])?;
    if sha.is_empty() {
        return Err(PatchwiseError::GitError(format!(
            "revision '{rev}' does not name a commit"
        )));
    }
    Ok(sha)
}

/// Capture the HEAD commit SHA.
pub fn capture_head_sha(repo_dir: &Path) -> Result<String> {
    resolve_revision(repo_dir, "HEAD")
}

/// Full SHA of the first parent of `rev`.
pub fn parent_of(repo_dir: &Path, rev: &str) -> Result<String> {
    resolve_revision(repo_dir, &format!("{rev}^"))
}

/// Build a [`PatchReference`] for `target` (default `HEAD`) against `base`
/// (default: the target's parent), with both revisions fully resolved.
pub fn patch_reference(
    repo_dir: &Path,
    target: Option<&str>,
    base: Option<&str>,
) -> Result<PatchReference> {
    let target = resolve_revision(repo_dir, target.unwrap_or("HEAD"))?;
    let base = match base {
        Some(rev) => resolve_revision(repo_dir, rev)?,
        None => parent_of(repo_dir, &target)?,
    };
    let repo_path = repo_dir
        .canonicalize()
        .unwrap_or_else(|_| repo_dir.to_path_buf());
    PatchReference::new(repo_path, base, target)
}

/// Raw commit message (subject, body and trailers) of `rev`.
pub fn commit_message(repo_dir: &Path, rev: &str) -> Result<String> {
    git_output(repo_dir, &["log", "-1", "--format=%B", rev])
}

/// `git diff base target` for the whole tree.
pub fn diff(repo_dir: &Path, patch: &PatchReference) -> Result<String> {
    git_output(
        repo_dir,
        &[
            "diff",
            "--no-color",
            "--no-ext-diff",
            patch.base_revision.as_str(),
            patch.target_revision.as_str(),
        ],
    )
}

/// Author line of `rev` as `Name <email>`.
pub fn author(repo_dir: &Path, rev: &str) -> Result<String> {
    git_output(repo_dir, &["log", "-1", "--format=%an <%ae>", rev])
}

/// Check whether a directory is inside a git work tree.
pub fn is_git_repo(dir: &Path) -> bool {
    Command::new("git")
        .args(["rev-parse", "--is-inside-work-tree"])
        .current_dir(dir)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;
    use std::process::Command as StdCommand;

    fn run_git(repo_dir: &Path, args: &[&str]) {
        let output = StdCommand::new("git")
            .args(args)
            .current_dir(repo_dir)
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    fn make_git_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        run_git(dir.path(), &["init", "-q"]);
        run_git(dir.path(), &["config", "user.name", "test-user"]);
        run_git(dir.path(), &["config", "user.email", "test@example.com"]);
        fs::create_dir_all(dir.path().join("drivers")).unwrap();
        fs::write(dir.path().join("drivers/foo.c"), "int foo;\n").unwrap();
        run_git(dir.path(), &["add", "."]);
        run_git(dir.path(), &["commit", "-q", "-m", "initial"]);
        fs::write(dir.path().join("drivers/foo.c"), "int foo;\nint bar;\n").unwrap();
        run_git(dir.path(), &["commit", "-q", "-am", "foo: add bar\n\nSigned-off-by: T <t@e>"]);
        dir
    }

    #[test]
    fn capture_head_sha_returns_40_hex_chars() {
        let repo = make_git_repo();
        let sha = capture_head_sha(repo.path()).unwrap();
        assert_eq!(sha.len(), 40, "SHA should be 40 hex chars, got: {sha}");
        assert!(sha.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn capture_head_sha_fails_outside_repo() {
        let dir = tempfile::tempdir().unwrap();
        assert!(capture_head_sha(dir.path()).is_err());
    }

    #[test]
    fn resolve_unknown_revision_fails() {
        let repo = make_git_repo();
        assert!(resolve_revision(repo.path(), "no-such-branch").is_err());
    }

    #[test]
    fn patch_reference_defaults_to_head_and_parent() {
        let repo = make_git_repo();
        let patch = patch_reference(repo.path(), None, None).unwrap();
        assert_eq!(patch.target_revision, capture_head_sha(repo.path()).unwrap());
        assert_eq!(patch.base_revision, parent_of(repo.path(), "HEAD").unwrap());
    }

    #[test]
    fn diff_covers_the_target_commit() {
        let repo = make_git_repo();
        let patch = patch_reference(repo.path(), None, None).unwrap();
        let text = diff(repo.path(), &patch).unwrap();
        assert!(text.contains("+int bar;"));
    }

    #[test]
    fn commit_message_and_author() {
        let repo = make_git_repo();
        let msg = commit_message(repo.path(), "HEAD").unwrap();
        assert!(msg.starts_with("foo: add bar"));
        assert!(msg.contains("Signed-off-by: T <t@e>"));

        assert_eq!(author(repo.path(), "HEAD").unwrap(), "test-user <test@example.com>");
    }

    #[test]
    fn is_git_repo_true_for_repo() {
        let repo = make_git_repo();
        assert!(is_git_repo(repo.path()));
    }

    #[test]
    fn is_git_repo_false_for_non_repo() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_git_repo(dir.path()));
    }
}
