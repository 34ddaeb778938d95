//! Container runtime seam
//!
//! The executor only needs a handful of runtime operations. They live behind
//! [`ContainerRuntime`] so the Docker implementation can be swapped for an
//! in-memory one in tests.

use std::path::PathBuf;
use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;

/// Path the task directory is mounted at inside every sandbox
pub const CONTAINER_MOUNT_PATH: &str = "/app";

/// Keeps the container alive so commands can be exec'd into it
pub const IDLE_COMMAND: [&str; 3] = ["tail", "-f", "/dev/null"];

/// Combined stdout/stderr of one exec, in arrival order
pub type OutputStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, RuntimeError>> + Send>>;

/// Everything needed to create one sandbox container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Unique container name
    pub name: String,
    /// Image reference, e.g. "python:3.12-slim"
    pub image: String,
    /// Absolute host directory bind-mounted into the container
    pub host_dir: PathBuf,
    /// Mount target inside the container (also its working directory)
    pub mount_path: String,
    /// Main process of the container
    pub command: Vec<String>,
}

impl ContainerSpec {
    /// A container that idles with the task directory mounted at `/app`
    pub fn idle(name: impl Into<String>, image: impl Into<String>, host_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            host_dir: host_dir.into(),
            mount_path: CONTAINER_MOUNT_PATH.to_string(),
            command: IDLE_COMMAND.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Errors reported by a container runtime
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("exec {0} started detached, no output to attach to")]
    Detached(String),
    #[error("exec {0} reported no exit code")]
    MissingExitCode(String),
    #[error("{0}")]
    Other(String),
}

/// Operations the executor needs from a container runtime
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a container and return its runtime id
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    /// Start a created container
    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Create an exec instance attached to stdout and stderr; returns the exec id
    async fn create_exec(
        &self,
        container_id: &str,
        cmd: Vec<String>,
        working_dir: &str,
    ) -> Result<String, RuntimeError>;

    /// Start an exec instance and attach to its combined output
    async fn attach_exec(&self, exec_id: &str) -> Result<OutputStream, RuntimeError>;

    /// Exit code of a finished exec instance
    async fn exec_exit_code(&self, exec_id: &str) -> Result<i64, RuntimeError>;

    /// Stop a running container
    async fn stop_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Remove a container; `force` kills it first if it is still running
    async fn remove_container(&self, id: &str, force: bool) -> Result<(), RuntimeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_spec_mounts_workdir_at_app() {
        let spec = ContainerSpec::idle("codexec-abc", "alpine:3", "/tmp/work");
        assert_eq!(spec.mount_path, "/app");
        assert_eq!(spec.command, vec!["tail", "-f", "/dev/null"]);
        assert_eq!(spec.host_dir, PathBuf::from("/tmp/work"));
    }
}
