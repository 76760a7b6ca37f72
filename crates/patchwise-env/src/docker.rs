//! Container-backed provider.
//!
//! Images are content-addressed: `patchwise-base:<digest12>` from
//! `base.Dockerfile`, and `patchwise-<env>:<digest12>` from
//! `<env>.Dockerfile` built on top of it. Environments without their own
//! Dockerfile use the base image. Every acquisition starts a dedicated
//! container with the scratch directory and any extra host paths mounted at
//! the same location, so paths never need translating.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::cache::EnvironmentCache;
use crate::digest::{hash_definition, ContentHash};
use crate::error::EnvError;
use crate::provider::{EnvironmentHandle, EnvironmentProvider, ExecTarget};
use crate::Result;

pub const BASE_ENVIRONMENT: &str = "base";

/// Configuration for [`DockerProvider`].
#[derive(Debug, Clone)]
pub struct DockerConfig {
    pub docker_bin: String,
    /// Holds `base.Dockerfile` and optional `<env>.Dockerfile` files.
    pub dockerfiles_dir: PathBuf,
    /// Host paths bind-mounted into every container (the repository).
    pub mounts: Vec<PathBuf>,
}

impl DockerConfig {
    pub fn new(dockerfiles_dir: impl Into<PathBuf>) -> Self {
        Self {
            docker_bin: "docker".to_string(),
            dockerfiles_dir: dockerfiles_dir.into(),
            mounts: Vec::new(),
        }
    }

    pub fn with_mount(mut self, path: impl Into<PathBuf>) -> Self {
        self.mounts.push(path.into());
        self
    }

    fn dockerfile(&self, environment_id: &str) -> PathBuf {
        self.dockerfiles_dir
            .join(format!("{environment_id}.Dockerfile"))
    }
}

pub struct DockerProvider {
    config: DockerConfig,
    cache: Arc<EnvironmentCache>,
}

impl DockerProvider {
    pub fn new(config: DockerConfig, cache: Arc<EnvironmentCache>) -> Self {
        Self { config, cache }
    }

    async fn docker(&self, args: &[&str]) -> Result<std::process::Output> {
        tokio::process::Command::new(&self.config.docker_bin)
            .args(args)
            .stdin(std::process::Stdio::null())
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    EnvError::DockerUnavailable(format!("{} not found", self.config.docker_bin))
                } else {
                    EnvError::Io(e)
                }
            })
    }

    async fn image_exists(&self, tag: &str) -> Result<bool> {
        Ok(self.docker(&["image", "inspect", tag]).await?.status.success())
    }

    /// Build `dockerfile` as `tag` unless the tag already exists.
    async fn ensure_image(
        &self,
        environment_id: &str,
        tag: &str,
        dockerfile: &Path,
        build_args: &[String],
    ) -> Result<String> {
        if self.image_exists(tag).await? {
            debug!(tag = %tag, "reusing existing image");
            return Ok(tag.to_string());
        }

        info!(environment = %environment_id, tag = %tag, "building image");
        let file = dockerfile.to_string_lossy().into_owned();
        let context = self.config.dockerfiles_dir.to_string_lossy().into_owned();
        let mut args: Vec<&str> = vec!["build", "-f", file.as_str(), "-t", tag];
        for arg in build_args {
            args.push("--build-arg");
            args.push(arg);
        }
        args.push(context.as_str());

        let output = self.docker(&args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EnvError::BuildFailed {
                environment: environment_id.to_string(),
                reason: tail(&stderr, 20),
            });
        }
        Ok(tag.to_string())
    }

    async fn base_image(&self) -> Result<(ContentHash, String)> {
        let dockerfile = self.config.dockerfile(BASE_ENVIRONMENT);
        if !dockerfile.is_file() {
            return Err(EnvError::BuildFailed {
                environment: BASE_ENVIRONMENT.to_string(),
                reason: format!("{} does not exist", dockerfile.display()),
            });
        }
        let digest = hash_definition(&dockerfile, None)?;
        let tag = image_tag(BASE_ENVIRONMENT, &digest);
        let entry = self
            .cache
            .get_or_build(BASE_ENVIRONMENT, &digest.0, || {
                self.ensure_image(BASE_ENVIRONMENT, &tag, &dockerfile, &[])
            })
            .await?;
        Ok((digest, entry.tag))
    }

    /// Resolve (building if needed) the image for `environment_id`.
    pub async fn prepare(&self, environment_id: &str) -> Result<(ContentHash, String)> {
        let (base_digest, base_tag) = self.base_image().await?;
        if environment_id == BASE_ENVIRONMENT {
            return Ok((base_digest, base_tag));
        }

        let dockerfile = self.config.dockerfile(environment_id);
        if !dockerfile.is_file() {
            debug!(environment = %environment_id, "no dedicated Dockerfile, using base image");
            return Ok((base_digest, base_tag));
        }

        let digest = hash_definition(&dockerfile, Some(&base_digest))?;
        let tag = image_tag(environment_id, &digest);
        let build_args = vec![format!("BASE_IMAGE={base_tag}")];
        let entry = self
            .cache
            .get_or_build(environment_id, &digest.0, || {
                self.ensure_image(environment_id, &tag, &dockerfile, &build_args)
            })
            .await?;
        Ok((digest, entry.tag))
    }
}

#[async_trait]
impl EnvironmentProvider for DockerProvider {
    fn name(&self) -> &'static str {
        "docker"
    }

    #[instrument(skip(self), fields(provider = "docker"))]
    async fn acquire(&self, environment_id: &str) -> Result<EnvironmentHandle> {
        let (digest, image) = self.prepare(environment_id).await?;

        let instance_id = format!("{environment_id}-{}", uuid::Uuid::new_v4().simple());
        let scratch_dir = self.cache.scratch_root().join(&instance_id);
        tokio::fs::create_dir_all(&scratch_dir).await?;

        let name = format!("patchwise-{instance_id}");
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--rm".into(),
            "--name".into(),
            name,
        ];
        if let Some(user) = owner_of(&scratch_dir) {
            args.push("--user".into());
            args.push(user);
            // The host uid has no home in the image; git needs one for its
            // global config.
            args.push("-e".into());
            args.push(format!("HOME={}", scratch_dir.display()));
        }
        for path in std::iter::once(&scratch_dir).chain(self.config.mounts.iter()) {
            args.push("-v".into());
            args.push(format!("{0}:{0}", path.display()));
        }
        args.extend([image, "tail".into(), "-f".into(), "/dev/null".into()]);

        let argv: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.docker(&argv).await?;
        if !output.status.success() {
            if let Err(e) = tokio::fs::remove_dir_all(&scratch_dir).await {
                warn!(path = %scratch_dir.display(), error = %e, "failed to remove scratch dir");
            }
            return Err(EnvError::CommandFailed(format!(
                "docker run failed: {}",
                tail(&String::from_utf8_lossy(&output.stderr), 5)
            )));
        }
        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!(instance = %instance_id, container = %container_id, "container started");

        Ok(EnvironmentHandle {
            environment_id: environment_id.to_string(),
            instance_id,
            scratch_dir,
            digest: digest.0,
            target: ExecTarget::Container {
                docker_bin: self.config.docker_bin.clone(),
                container_id,
            },
        })
    }

    async fn release(&self, handle: EnvironmentHandle) -> Result<()> {
        if let ExecTarget::Container { container_id, .. } = &handle.target {
            let output = self.docker(&["rm", "-f", container_id]).await?;
            if !output.status.success() {
                warn!(
                    container = %container_id,
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "failed to remove container"
                );
            }
        }
        match tokio::fs::remove_dir_all(&handle.scratch_dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// `patchwise-<env>:<digest12>`
pub fn image_tag(environment_id: &str, digest: &ContentHash) -> String {
    format!("patchwise-{environment_id}:{}", digest.short())
}

/// `uid:gid` owning `path`, so container writes stay removable by the host.
#[cfg(unix)]
fn owner_of(path: &Path) -> Option<String> {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata(path)
        .ok()
        .map(|m| format!("{}:{}", m.uid(), m.gid()))
}

#[cfg(not(unix))]
fn owner_of(_path: &Path) -> Option<String> {
    None
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_tag_format() {
        let digest = ContentHash("0123456789abcdef".repeat(4));
        assert_eq!(image_tag("sparse", &digest), "patchwise-sparse:0123456789ab");
    }

    #[test]
    fn test_dockerfile_path() {
        let config = DockerConfig::new("/opt/patchwise/dockerfiles").with_mount("/src/linux");
        assert_eq!(
            config.dockerfile("dt-check"),
            PathBuf::from("/opt/patchwise/dockerfiles/dt-check.Dockerfile")
        );
        assert_eq!(config.mounts, vec![PathBuf::from("/src/linux")]);
    }

    #[tokio::test]
    async fn test_missing_docker_binary_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let dockerfiles = dir.path().join("dockerfiles");
        std::fs::create_dir_all(&dockerfiles).unwrap();
        std::fs::write(dockerfiles.join("base.Dockerfile"), "FROM debian:stable\n").unwrap();

        let mut config = DockerConfig::new(&dockerfiles);
        config.docker_bin = "patchwise-no-such-docker".to_string();
        let cache = Arc::new(EnvironmentCache::open(dir.path().join("cache")).unwrap());
        let provider = DockerProvider::new(config, cache);

        let err = provider.acquire("sparse").await.unwrap_err();
        assert!(matches!(err, EnvError::DockerUnavailable(_)));
        assert_eq!(
            err.kind(),
            patchwise_core::CheckErrorKind::EnvironmentUnavailable
        );
    }

    #[tokio::test]
    async fn test_missing_base_dockerfile_is_build_failure() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(EnvironmentCache::open(dir.path().join("cache")).unwrap());
        let provider = DockerProvider::new(DockerConfig::new(dir.path().join("none")), cache);
        let err = provider.acquire("base").await.unwrap_err();
        assert!(matches!(err, EnvError::BuildFailed { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_run_removes_scratch_dir() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let dockerfiles = dir.path().join("dockerfiles");
        std::fs::create_dir_all(&dockerfiles).unwrap();
        std::fs::write(dockerfiles.join("base.Dockerfile"), "FROM debian:stable\n").unwrap();

        // Images already exist; only `run` fails.
        let fake = dir.path().join("fake-docker");
        std::fs::write(
            &fake,
            "#!/bin/sh\ncase \"$1\" in\n  run) echo 'no space left on device' >&2; exit 1 ;;\n  *) exit 0 ;;\nesac\n",
        )
        .unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = DockerConfig::new(&dockerfiles);
        config.docker_bin = fake.to_string_lossy().into_owned();
        let cache = Arc::new(EnvironmentCache::open(dir.path().join("cache")).unwrap());
        let provider = DockerProvider::new(config, cache.clone());

        let err = provider.acquire("base").await.unwrap_err();
        assert!(matches!(err, EnvError::CommandFailed(ref msg) if msg.contains("no space left")));

        let leftover: Vec<_> = std::fs::read_dir(cache.scratch_root())
            .unwrap()
            .collect();
        assert!(leftover.is_empty(), "scratch dirs left behind: {leftover:?}");
    }

    #[test]
    fn test_tail() {
        assert_eq!(tail("a\nb\nc", 2), "b\nc");
        assert_eq!(tail("a", 5), "a");
    }
}
