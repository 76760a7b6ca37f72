//! Content hashing for environment definitions and source trees.
//!
//! Environment images are addressed by the SHA-256 of their definition, so a
//! changed Dockerfile yields a new tag and an unchanged one reuses the image.

use crate::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::debug;

/// Content address of an environment or tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ContentHash {
    pub fn of_bytes(parts: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part);
            hasher.update(b"\0");
        }
        ContentHash(hex::encode(hasher.finalize()))
    }

    /// First 12 characters, used in image tags.
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

/// Hash a Dockerfile together with the digest of the image it builds on.
pub fn hash_definition(dockerfile: &Path, parent: Option<&ContentHash>) -> Result<ContentHash> {
    let content = std::fs::read(dockerfile)?;
    let parent = parent.map(|p| p.0.as_bytes()).unwrap_or_default();
    let hash = ContentHash::of_bytes(&[&content, parent]);
    debug!(file = %dockerfile.display(), hash = %hash.short(), "hashed environment definition");
    Ok(hash)
}

/// Hash the files of a materialized tree, ignoring the `.git` link.
///
/// Paths and contents are hashed in sorted order, so two trees with the same
/// files hash the same regardless of where they live.
pub fn hash_tree(root: &Path) -> Result<ContentHash> {
    let mut hasher = Sha256::new();
    hash_tree_recursive(root, root, &mut hasher)?;
    Ok(ContentHash(hex::encode(hasher.finalize())))
}

fn hash_tree_recursive(root: &Path, dir: &Path, hasher: &mut Sha256) -> Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.filter_map(|e| e.ok()).collect();
    entries.sort_by_key(|e| e.path());

    for entry in entries {
        let path = entry.path();
        if path.file_name().is_some_and(|n| n == ".git") {
            continue;
        }
        let rel = path.strip_prefix(root).unwrap_or(&path);
        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update(b"\0");

        let file_type = entry.file_type()?;
        if file_type.is_symlink() {
            let target = std::fs::read_link(&path)?;
            hasher.update(target.to_string_lossy().as_bytes());
            hasher.update(b"\0");
        } else if file_type.is_file() {
            hasher.update(&std::fs::read(&path)?);
            hasher.update(b"\0");
        } else if file_type.is_dir() {
            hash_tree_recursive(root, &path, hasher)?;
        }
    }
    Ok(())
}
