//! Revision materialization.
//!
//! Every check invocation gets its own detached git worktree at the target
//! revision, inside the scratch directory of its environment instance.
//! Worktrees share the repository's object store but never each other's
//! files.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use patchwise_core::PatchReference;

use crate::error::EnvError;
use crate::provider::EnvironmentHandle;
use crate::Result;

/// A checked-out, clean tree for one check invocation.
#[derive(Debug)]
pub struct MaterializedTree {
    pub root: PathBuf,
    pub repo_path: PathBuf,
    pub revision: String,
    /// Fixup patches that applied cleanly.
    pub applied_fixups: Vec<PathBuf>,
    /// `None` for trees that are not registered git worktrees.
    lock: Option<Arc<Mutex<()>>>,
}

impl MaterializedTree {
    /// A plain directory tree, not registered with git. Destroying it just
    /// deletes `root`.
    pub fn detached(root: PathBuf, repo_path: PathBuf, revision: impl Into<String>) -> Self {
        Self {
            root,
            repo_path,
            revision: revision.into(),
            applied_fixups: Vec::new(),
            lock: None,
        }
    }

    /// Remove the worktree. Failures are logged and swallowed.
    pub async fn destroy(self) {
        let root = self.root.to_string_lossy().into_owned();
        let Some(lock) = &self.lock else {
            if let Err(e) = tokio::fs::remove_dir_all(&self.root).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(tree = %root, error = %e, "failed to delete tree directory");
                }
            }
            return;
        };
        let _guard = lock.lock().await;
        if let Err(e) = git(&self.repo_path, &["worktree", "remove", "--force", root.as_str()]).await {
            warn!(tree = %root, error = %e, "failed to remove worktree");
            if let Err(e) = tokio::fs::remove_dir_all(&self.root).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(tree = %root, error = %e, "failed to delete worktree directory");
                }
            }
        }
        if let Err(e) = git(&self.repo_path, &["worktree", "prune"]).await {
            warn!(error = %e, "git worktree prune failed");
        }
    }
}

/// Prepares source trees for check invocations.
#[async_trait]
pub trait Materializer: Send + Sync {
    async fn materialize(
        &self,
        handle: &EnvironmentHandle,
        patch: &PatchReference,
        fixups: &[PathBuf],
    ) -> Result<MaterializedTree>;
}

/// Materializer backed by `git worktree`.
#[derive(Default)]
pub struct GitMaterializer {
    /// Serializes worktree bookkeeping in the shared repository.
    lock: Arc<Mutex<()>>,
}

impl GitMaterializer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Materializer for GitMaterializer {
    #[instrument(skip_all, fields(instance = %handle.instance_id, revision = %patch.short_target()))]
    async fn materialize(
        &self,
        handle: &EnvironmentHandle,
        patch: &PatchReference,
        fixups: &[PathBuf],
    ) -> Result<MaterializedTree> {
        let repo = patch.repo_path.as_path();
        let rev = patch.target_revision.as_str();
        let root = handle.scratch_dir.join("tree");
        let root_str = root.to_string_lossy().into_owned();

        // Tools running inside a container see the repository under a
        // different owner, which git refuses without this.
        if handle.is_container() {
            let repo_str = repo.to_string_lossy().into_owned();
            for path in [&repo_str, &root_str] {
                let args = ["config", "--global", "--add", "safe.directory", path.as_str()];
                let output = handle.command("git", &args[..], &handle.scratch_dir).output().await?;
                if !output.status.success() {
                    warn!(path = %path, "failed to mark directory as safe in container");
                }
            }
        }

        let spec = format!("{rev}^{{commit}}");
        if git(repo, &["cat-file", "-e", spec.as_str()]).await.is_err() {
            return Err(EnvError::RevisionNotFound(format!(
                "{rev} in {}",
                repo.display()
            )));
        }

        {
            let _guard = self.lock.lock().await;
            git(repo, &["worktree", "add", "--detach", "--force", root_str.as_str(), rev]).await?;
        }

        let tree = MaterializedTree {
            root: root.clone(),
            repo_path: repo.to_path_buf(),
            revision: rev.to_string(),
            applied_fixups: Vec::new(),
            lock: Some(self.lock.clone()),
        };

        match prepare_tree(&root, rev, fixups).await {
            Ok(applied) => {
                info!(tree = %root_str, fixups = applied.len(), "tree materialized");
                Ok(MaterializedTree {
                    applied_fixups: applied,
                    ..tree
                })
            }
            Err(e) => {
                tree.destroy().await;
                Err(e)
            }
        }
    }
}

async fn prepare_tree(root: &Path, rev: &str, fixups: &[PathBuf]) -> Result<Vec<PathBuf>> {
    git(root, &["reset", "--quiet", "--hard", rev]).await?;
    git(root, &["clean", "-ffdxq"]).await?;

    let status = git(root, &["status", "--porcelain"]).await?;
    if !status.trim().is_empty() {
        return Err(EnvError::DirtyState(status.trim().to_string()));
    }

    let mut applied = Vec::new();
    for patch in fixups {
        let patch_str = patch.to_string_lossy().into_owned();
        match git(root, &["apply", patch_str.as_str()]).await {
            Ok(_) => {
                debug!(patch = %patch_str, "fixup applied");
                applied.push(patch.clone());
            }
            Err(e) => warn!(patch = %patch_str, error = %e, "fixup patch did not apply, skipping"),
        }
    }
    Ok(applied)
}

/// Run git on the host and return stdout.
async fn git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = tokio::process::Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .stdin(std::process::Stdio::null())
        .output()
        .await
        .map_err(|e| EnvError::Git(format!("failed to run git: {e}")))?;
    if !output.status.success() {
        return Err(EnvError::Git(format!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
