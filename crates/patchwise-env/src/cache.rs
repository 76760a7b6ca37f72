//! Environment cache.
//!
//! Tracks which environment digests have been built, and makes sure that a
//! given environment is built at most once at a time no matter how many
//! checks ask for it concurrently. The on-disk index is advisory: deleting
//! it only forces a rebuild check.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use crate::Result;

pub const INDEX_FILE: &str = "environments.json";

/// A built environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheEntry {
    pub digest: String,
    /// Image tag, or the host marker for local environments.
    pub tag: String,
    pub built_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheIndex {
    environments: BTreeMap<String, CacheEntry>,
}

type Slot = Arc<OnceCell<CacheEntry>>;

/// Single-flight environment cache backed by `<root>/environments.json`.
pub struct EnvironmentCache {
    root: PathBuf,
    index: Mutex<CacheIndex>,
    inflight: Mutex<HashMap<(String, String), Slot>>,
}

impl EnvironmentCache {
    /// Open the cache rooted at `root`. A corrupt index is discarded.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let index = load_index(&root.join(INDEX_FILE));
        Ok(Self {
            root,
            index: Mutex::new(index),
            inflight: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for per-invocation scratch space.
    pub fn scratch_root(&self) -> PathBuf {
        self.root.join("scratch")
    }

    /// Recorded entry for `environment_id`, if any.
    pub async fn lookup(&self, environment_id: &str) -> Option<CacheEntry> {
        self.index
            .lock()
            .await
            .environments
            .get(environment_id)
            .cloned()
    }

    /// Return the entry for `(environment_id, digest)`, running `build` if no
    /// one has built it in this process yet. Concurrent callers for the same
    /// pair wait for a single build. A failed build is not remembered, so
    /// the next caller retries.
    pub async fn get_or_build<F, Fut>(
        &self,
        environment_id: &str,
        digest: &str,
        build: F,
    ) -> Result<CacheEntry>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        let slot = {
            let mut inflight = self.inflight.lock().await;
            inflight
                .entry((environment_id.to_string(), digest.to_string()))
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let entry = slot
            .get_or_try_init(|| async {
                debug!(environment = %environment_id, digest = %digest, "building environment");
                let tag = build().await?;
                let entry = CacheEntry {
                    digest: digest.to_string(),
                    tag,
                    built_at: Utc::now(),
                };
                self.record(environment_id, entry.clone()).await;
                info!(environment = %environment_id, tag = %entry.tag, "environment ready");
                Ok::<_, crate::EnvError>(entry)
            })
            .await?;

        Ok(entry.clone())
    }

    async fn record(&self, environment_id: &str, entry: CacheEntry) {
        let mut index = self.index.lock().await;
        index
            .environments
            .insert(environment_id.to_string(), entry);
        // Written under the lock so concurrent records land in order.
        if let Err(e) = save_index(&self.root.join(INDEX_FILE), &index).await {
            warn!(error = %e, "failed to persist environment index");
        }
    }
}

fn load_index(path: &Path) -> CacheIndex {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(_) => return CacheIndex::default(),
    };
    match serde_json::from_slice(&bytes) {
        Ok(index) => index,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "discarding corrupt environment index");
            CacheIndex::default()
        }
    }
}

async fn save_index(path: &Path, index: &CacheIndex) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, serde_json::to_vec_pretty(index)?).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
