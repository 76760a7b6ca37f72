//! Patchwise environments.
//!
//! Provides isolated execution environments for checks and prepares a
//! clean, revision-pinned source tree inside each one.
//!
//! - [`EnvironmentProvider`]: acquire/release instances by environment id
//!   ([`LocalProvider`] on the host, [`DockerProvider`] in containers)
//! - [`EnvironmentCache`]: single-flight builds and the on-disk index
//! - [`Materializer`]: per-invocation git worktrees

pub mod cache;
pub mod digest;
pub mod docker;
pub mod error;
pub mod local;
pub mod materialize;
pub mod provider;

pub use cache::{CacheEntry, EnvironmentCache};
pub use digest::{hash_definition, hash_tree, ContentHash};
pub use docker::{image_tag, DockerConfig, DockerProvider, BASE_ENVIRONMENT};
pub use error::EnvError;
pub use local::LocalProvider;
pub use materialize::{GitMaterializer, MaterializedTree, Materializer};
pub use provider::{EnvironmentHandle, EnvironmentProvider, ExecTarget};

/// Result type for patchwise-env operations
pub type Result<T> = std::result::Result<T, EnvError>;
