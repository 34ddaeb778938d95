//! Docker implementation of [`ContainerRuntime`] on top of bollard

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use bollard::Docker;
use futures_util::StreamExt;

use super::runtime::{ContainerRuntime, ContainerSpec, OutputStream, RuntimeError};

/// Grace period before `docker stop` kills the idle process
const DEFAULT_STOP_TIMEOUT_SECS: i64 = 2;

/// Container runtime backed by the local Docker daemon
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
    stop_timeout_secs: i64,
}

impl DockerRuntime {
    /// Connect using `DOCKER_HOST` or the platform's default socket
    pub fn connect_local() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self::from_client(docker))
    }

    /// Wrap an existing bollard client
    pub fn from_client(docker: Docker) -> Self {
        Self {
            docker,
            stop_timeout_secs: DEFAULT_STOP_TIMEOUT_SECS,
        }
    }

    /// Override the stop grace period
    pub fn with_stop_timeout(mut self, secs: i64) -> Self {
        self.stop_timeout_secs = secs;
        self
    }

    /// Check that the daemon answers
    pub async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker.ping().await?;
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let host_config = HostConfig {
            mounts: Some(vec![Mount {
                typ: Some(MountTypeEnum::BIND),
                source: Some(spec.host_dir.to_string_lossy().into_owned()),
                target: Some(spec.mount_path.clone()),
                ..Default::default()
            }]),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            working_dir: Some(spec.mount_path.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };

        let response = self.docker.create_container(Some(options), config).await?;
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker.start_container::<String>(id, None).await?;
        Ok(())
    }

    async fn create_exec(
        &self,
        container_id: &str,
        cmd: Vec<String>,
        working_dir: &str,
    ) -> Result<String, RuntimeError> {
        let options = CreateExecOptions {
            cmd: Some(cmd),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            working_dir: Some(working_dir.to_string()),
            ..Default::default()
        };
        let created = self.docker.create_exec(container_id, options).await?;
        Ok(created.id)
    }

    async fn attach_exec(&self, exec_id: &str) -> Result<OutputStream, RuntimeError> {
        match self.docker.start_exec(exec_id, None).await? {
            StartExecResults::Attached { output, .. } => Ok(Box::pin(output.map(|chunk| {
                chunk
                    .map(|log| log.into_bytes().to_vec())
                    .map_err(RuntimeError::from)
            }))),
            StartExecResults::Detached => Err(RuntimeError::Detached(exec_id.to_string())),
        }
    }

    async fn exec_exit_code(&self, exec_id: &str) -> Result<i64, RuntimeError> {
        let inspect = self.docker.inspect_exec(exec_id).await?;
        inspect
            .exit_code
            .ok_or_else(|| RuntimeError::MissingExitCode(exec_id.to_string()))
    }

    async fn stop_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .stop_container(
                id,
                Some(StopContainerOptions {
                    t: self.stop_timeout_secs,
                }),
            )
            .await?;
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore = "Requires a running Docker daemon and the alpine image"]
    async fn test_echo_round_trip() {
        let runtime = DockerRuntime::connect_local().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let spec = ContainerSpec::idle("codexec-docker-test", "alpine:3", dir.path());

        let id = runtime.create_container(&spec).await.unwrap();
        runtime.start_container(&id).await.unwrap();
        let exec = runtime
            .create_exec(&id, vec!["/bin/sh".into(), "-c".into(), "echo hi".into()], "/app")
            .await
            .unwrap();
        let mut output = runtime.attach_exec(&exec).await.unwrap();
        let mut buf = Vec::new();
        while let Some(chunk) = output.next().await {
            buf.extend(chunk.unwrap());
        }
        assert_eq!(runtime.exec_exit_code(&exec).await.unwrap(), 0);
        assert_eq!(String::from_utf8_lossy(&buf), "hi\n");
        runtime.remove_container(&id, true).await.unwrap();
    }
}
