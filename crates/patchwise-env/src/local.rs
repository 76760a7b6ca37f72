//! Host toolchain provider.
//!
//! Instances are fresh scratch directories; commands run directly on the
//! host. An environment is "built" by probing that the tools it needs are
//! on `PATH`, once per process.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::cache::EnvironmentCache;
use crate::digest::ContentHash;
use crate::error::EnvError;
use crate::provider::{EnvironmentHandle, EnvironmentProvider, ExecTarget};
use crate::Result;

pub const HOST_TAG: &str = "host";

pub struct LocalProvider {
    cache: Arc<EnvironmentCache>,
    requirements: HashMap<String, Vec<String>>,
}

impl LocalProvider {
    pub fn new(cache: Arc<EnvironmentCache>) -> Self {
        Self {
            cache,
            requirements: HashMap::new(),
        }
    }

    /// Declare the executables `environment_id` needs.
    pub fn with_requirement(mut self, environment_id: &str, tools: &[&str]) -> Self {
        self.requirements.insert(
            environment_id.to_string(),
            tools.iter().map(|t| t.to_string()).collect(),
        );
        self
    }

    fn digest(&self, environment_id: &str, tools: &[String]) -> ContentHash {
        let mut parts: Vec<&[u8]> = vec![environment_id.as_bytes()];
        parts.extend(tools.iter().map(|t| t.as_bytes()));
        ContentHash::of_bytes(&parts)
    }
}

#[async_trait]
impl EnvironmentProvider for LocalProvider {
    fn name(&self) -> &'static str {
        "local"
    }

    #[instrument(skip(self), fields(provider = "local"))]
    async fn acquire(&self, environment_id: &str) -> Result<EnvironmentHandle> {
        let tools = self
            .requirements
            .get(environment_id)
            .cloned()
            .unwrap_or_default();
        let digest = self.digest(environment_id, &tools);

        self.cache
            .get_or_build(environment_id, &digest.0, || async {
                for tool in &tools {
                    if which::which(tool).is_err() {
                        return Err(EnvError::MissingTool {
                            environment: environment_id.to_string(),
                            tool: tool.clone(),
                        });
                    }
                }
                Ok(HOST_TAG.to_string())
            })
            .await?;

        let instance_id = format!("{environment_id}-{}", uuid::Uuid::new_v4().simple());
        let scratch_dir = self.cache.scratch_root().join(&instance_id);
        tokio::fs::create_dir_all(&scratch_dir).await?;
        debug!(instance = %instance_id, "acquired host environment");

        Ok(EnvironmentHandle {
            environment_id: environment_id.to_string(),
            instance_id,
            scratch_dir,
            digest: digest.0,
            target: ExecTarget::Host,
        })
    }

    async fn release(&self, handle: EnvironmentHandle) -> Result<()> {
        match tokio::fs::remove_dir_all(&handle.scratch_dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
