//! Environment provider seam.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::Result;

/// Where commands for an environment instance execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecTarget {
    /// Directly on the host.
    Host,
    /// Inside a running container. Host paths are mounted at the same path,
    /// so no translation is needed.
    Container {
        docker_bin: String,
        container_id: String,
    },
}

/// One acquired environment instance. Exclusive to a single check
/// invocation; handed back through [`EnvironmentProvider::release`].
#[derive(Debug, Clone)]
pub struct EnvironmentHandle {
    pub environment_id: String,
    /// Unique per acquisition.
    pub instance_id: String,
    /// Private scratch space; the materialized tree lives under it.
    pub scratch_dir: PathBuf,
    /// Content address of the environment this instance was made from.
    pub digest: String,
    pub target: ExecTarget,
}

impl EnvironmentHandle {
    pub fn is_container(&self) -> bool {
        matches!(self.target, ExecTarget::Container { .. })
    }

    /// Build a command that runs `program args…` in `workdir` inside this
    /// instance. The child is killed if the returned command's child handle
    /// is dropped.
    pub fn command<S: AsRef<str>>(
        &self,
        program: &str,
        args: &[S],
        workdir: &Path,
    ) -> tokio::process::Command {
        let mut cmd = match &self.target {
            ExecTarget::Host => {
                let mut cmd = tokio::process::Command::new(program);
                cmd.args(args.iter().map(|a| a.as_ref()));
                cmd.current_dir(workdir);
                cmd
            }
            ExecTarget::Container {
                docker_bin,
                container_id,
            } => {
                let mut cmd = tokio::process::Command::new(docker_bin);
                cmd.arg("exec")
                    .arg("--workdir")
                    .arg(workdir)
                    .arg(container_id)
                    .arg(program)
                    .args(args.iter().map(|a| a.as_ref()));
                cmd
            }
        };
        cmd.stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// Provides isolated execution environments by id.
///
/// Distinct ids may be acquired concurrently. The same id may be acquired
/// concurrently as well; every acquisition gets its own instance sharing the
/// read-only base.
#[async_trait]
pub trait EnvironmentProvider: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    async fn acquire(&self, environment_id: &str) -> Result<EnvironmentHandle>;

    /// Tear down an instance. Errors are for logging only.
    async fn release(&self, handle: EnvironmentHandle) -> Result<()>;
}
