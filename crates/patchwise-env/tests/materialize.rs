//! Worktree materialization against throwaway git repositories.

use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use patchwise_core::{CheckErrorKind, PatchReference};
use patchwise_env::{
    hash_tree, EnvError, EnvironmentCache, EnvironmentProvider, GitMaterializer, LocalProvider,
    Materializer,
};

fn run_git(repo_dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
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
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Two commits: `base` adds drivers/foo.c, `target` modifies it.
fn make_repo() -> (tempfile::TempDir, PatchReference) {
    let dir = tempfile::tempdir().unwrap();
    let repo = dir.path();
    run_git(repo, &["init", "-q"]);
    run_git(repo, &["config", "user.name", "test-user"]);
    run_git(repo, &["config", "user.email", "test@example.com"]);
    fs::create_dir_all(repo.join("drivers")).unwrap();
    fs::write(repo.join("drivers/foo.c"), "int foo;\n").unwrap();
    fs::write(repo.join(".gitignore"), "*.o\n").unwrap();
    run_git(repo, &["add", "."]);
    run_git(repo, &["commit", "-q", "-m", "initial"]);
    let base = run_git(repo, &["rev-parse", "HEAD"]);
    fs::write(repo.join("drivers/foo.c"), "int foo;\nint bar;\n").unwrap();
    run_git(repo, &["commit", "-q", "-am", "foo: add bar"]);
    let target = run_git(repo, &["rev-parse", "HEAD"]);
    let patch = PatchReference::new(repo, base, target).unwrap();
    (dir, patch)
}

fn provider(cache_dir: &Path) -> LocalProvider {
    LocalProvider::new(Arc::new(EnvironmentCache::open(cache_dir).unwrap()))
}

#[tokio::test]
async fn materialize_is_idempotent() {
    let (repo, patch) = make_repo();
    let cache = tempfile::tempdir().unwrap();
    let provider = provider(cache.path());
    let materializer = GitMaterializer::new();

    let h1 = provider.acquire("base").await.unwrap();
    let h2 = provider.acquire("base").await.unwrap();
    let t1 = materializer.materialize(&h1, &patch, &[]).await.unwrap();
    let t2 = materializer.materialize(&h2, &patch, &[]).await.unwrap();

    assert_ne!(t1.root, t2.root);
    assert_eq!(hash_tree(&t1.root).unwrap(), hash_tree(&t2.root).unwrap());
    assert_eq!(
        fs::read_to_string(t1.root.join("drivers/foo.c")).unwrap(),
        "int foo;\nint bar;\n"
    );

    // Leftovers in the main checkout never leak into a tree.
    fs::write(repo.path().join("drivers/foo.c"), "garbage\n").unwrap();
    fs::write(repo.path().join("drivers/foo.o"), "obj").unwrap();
    let h3 = provider.acquire("base").await.unwrap();
    let t3 = materializer.materialize(&h3, &patch, &[]).await.unwrap();
    assert_eq!(hash_tree(&t1.root).unwrap(), hash_tree(&t3.root).unwrap());

    for (tree, handle) in [(t1, h1), (t2, h2), (t3, h3)] {
        let root = tree.root.clone();
        tree.destroy().await;
        assert!(!root.exists());
        provider.release(handle).await.unwrap();
    }
    assert_eq!(
        run_git(repo.path(), &["worktree", "list", "--porcelain"])
            .lines()
            .filter(|l| l.starts_with("worktree "))
            .count(),
        1
    );
}

#[tokio::test]
async fn trees_are_isolated() {
    let (_repo, patch) = make_repo();
    let cache = tempfile::tempdir().unwrap();
    let provider = provider(cache.path());
    let materializer = GitMaterializer::new();

    let h1 = provider.acquire("base").await.unwrap();
    let h2 = provider.acquire("sparse").await.unwrap();
    let t1 = materializer.materialize(&h1, &patch, &[]).await.unwrap();
    let t2 = materializer.materialize(&h2, &patch, &[]).await.unwrap();

    fs::write(t1.root.join("drivers/foo.o"), "build output").unwrap();
    fs::write(t1.root.join("drivers/foo.c"), "scribbled\n").unwrap();
    assert!(!t2.root.join("drivers/foo.o").exists());
    assert_eq!(
        fs::read_to_string(t2.root.join("drivers/foo.c")).unwrap(),
        "int foo;\nint bar;\n"
    );

    t1.destroy().await;
    t2.destroy().await;
    provider.release(h1).await.unwrap();
    provider.release(h2).await.unwrap();
}

#[tokio::test]
async fn unknown_revision_is_reported() {
    let (repo, patch) = make_repo();
    let cache = tempfile::tempdir().unwrap();
    let provider = provider(cache.path());
    let handle = provider.acquire("base").await.unwrap();

    let missing = PatchReference::new(
        repo.path(),
        patch.base_revision.clone(),
        "0123456789012345678901234567890123456789",
    )
    .unwrap();
    let err = GitMaterializer::new()
        .materialize(&handle, &missing, &[])
        .await
        .unwrap_err();
    assert!(matches!(err, EnvError::RevisionNotFound(_)));
    assert_eq!(err.kind(), CheckErrorKind::RevisionNotFound);
    provider.release(handle).await.unwrap();
}

#[tokio::test]
async fn fixups_apply_and_bad_fixups_are_skipped() {
    let (_repo, patch) = make_repo();
    let cache = tempfile::tempdir().unwrap();
    let fixup_dir = tempfile::tempdir().unwrap();

    let good = fixup_dir.path().join("good.patch");
    fs::write(
        &good,
        "diff --git a/drivers/foo.c b/drivers/foo.c\n\
         --- a/drivers/foo.c\n\
         +++ b/drivers/foo.c\n\
         @@ -1,2 +1,3 @@\n \
         int foo;\n \
         int bar;\n\
         +int baz;\n",
    )
    .unwrap();
    let bad = fixup_dir.path().join("bad.patch");
    fs::write(
        &bad,
        "diff --git a/missing.c b/missing.c\n\
         --- a/missing.c\n\
         +++ b/missing.c\n\
         @@ -1 +1 @@\n\
         -nothing\n\
         +something\n",
    )
    .unwrap();

    let provider = provider(cache.path());
    let handle = provider.acquire("base").await.unwrap();
    let tree = GitMaterializer::new()
        .materialize(&handle, &patch, &[bad.clone(), good.clone()])
        .await
        .unwrap();

    assert_eq!(tree.applied_fixups, vec![good]);
    assert_eq!(
        fs::read_to_string(tree.root.join("drivers/foo.c")).unwrap(),
        "int foo;\nint bar;\nint baz;\n"
    );
    tree.destroy().await;
    provider.release(handle).await.unwrap();
}
