//! Container Executor - runs one attempt's execution plan in a fresh sandbox
//!
//! The executor never interprets output: a non-zero exit code is a result,
//! not an error. [`ExecutorError`] is reserved for failures of the
//! environment itself (workdir, plan, log file, container runtime).

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use futures_util::StreamExt;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::handle::ContainerHandle;
use super::runtime::{ContainerRuntime, ContainerSpec, RuntimeError, CONTAINER_MOUNT_PATH};
use crate::codeblocks::{generate_commands, PlanError};
use crate::metrics::{EXECUTION_DURATION, RUNTIME_ERRORS};

/// Output reported when an attempt is skipped or abandoned on cancel
pub const CANCELED_OUTPUT: &str = "canceled";

/// One execution attempt of a task
#[derive(Debug, Clone)]
pub struct Attempt {
    /// 1-based attempt number within the task
    pub number: u32,
    /// Unique name of this attempt's container
    pub container_name: String,
    /// Image the container runs
    pub image: String,
    /// Task directory holding the generated files
    pub workdir: PathBuf,
    /// Combined output log, appended to by every attempt of the task
    pub log_file: PathBuf,
}

/// Outcome of running an attempt's plan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Exit code of the last command run (0 when nothing ran)
    pub exit_code: i64,
    /// Combined stdout/stderr of the last command run
    pub output: String,
    /// Set when the attempt was skipped or abandoned because of cancellation
    pub canceled: bool,
}

impl ExecutionResult {
    /// Sentinel returned when cancellation wins over execution
    pub fn canceled() -> Self {
        Self {
            exit_code: 0,
            output: CANCELED_OUTPUT.to_string(),
            canceled: true,
        }
    }

    /// True when the plan ran to completion with a zero exit code
    pub fn succeeded(&self) -> bool {
        !self.canceled && self.exit_code == 0
    }
}

/// Runtime call that failed during an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Create,
    Start,
    ExecCreate,
    ExecAttach,
    OutputCopy,
    ExecInspect,
    Stop,
    Remove,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Create => "create",
            Stage::Start => "start",
            Stage::ExecCreate => "exec-create",
            Stage::ExecAttach => "exec-attach",
            Stage::OutputCopy => "output-copy",
            Stage::ExecInspect => "exec-inspect",
            Stage::Stop => "stop",
            Stage::Remove => "remove",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures of the execution environment (never of the user's code)
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("failed to prepare working directory {path}: {source}")]
    Workdir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to build execution plan: {0}")]
    Plan(#[from] PlanError),
    #[error("failed to open output log {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("container runtime failed during {stage}: {source}")]
    Runtime {
        stage: Stage,
        #[source]
        source: RuntimeError,
    },
}

impl ExecutorError {
    /// Wrap a runtime error with the stage it happened in
    pub fn runtime(stage: Stage, source: RuntimeError) -> Self {
        RUNTIME_ERRORS.with_label_values(&[stage.as_str()]).inc();
        ExecutorError::Runtime { stage, source }
    }

    /// Stage of a runtime failure, if this is one
    pub fn stage(&self) -> Option<Stage> {
        match self {
            ExecutorError::Runtime { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

/// Runs attempts in ephemeral containers
pub struct ContainerExecutor {
    runtime: Arc<dyn ContainerRuntime>,
}

impl ContainerExecutor {
    /// Create an executor over a container runtime
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    /// Run one attempt: create a container, execute the plan, tear it down
    ///
    /// # Arguments
    /// * `attempt` - container name, image, workdir and log file for this attempt
    /// * `cancel` - task cancellation; checked on entry and raced against the plan
    ///
    /// # Returns
    /// The exit code and output of the last command, or the canceled sentinel.
    /// The container is gone by the time this returns, on every path.
    pub async fn run(
        &self,
        attempt: &Attempt,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecutorError> {
        let span = info_span!(
            "attempt",
            attempt = attempt.number,
            container = %attempt.container_name,
            image = %attempt.image,
        );
        self.run_attempt(attempt, cancel).instrument(span).await
    }

    async fn run_attempt(
        &self,
        attempt: &Attempt,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecutorError> {
        if cancel.is_cancelled() {
            info!("cancel requested, skipping container creation");
            return Ok(ExecutionResult::canceled());
        }

        let start = Instant::now();
        let host_dir = prepare_workdir(&attempt.workdir).await?;
        let container = self.provision(attempt, host_dir).await?;

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("cancel requested, abandoning running plan");
                Ok(ExecutionResult::canceled())
            }
            result = self.run_plan(&container, attempt) => result,
        };

        let teardown = match &outcome {
            Ok(result) if !result.canceled => container.release().await,
            _ => container.abort().await,
        };
        EXECUTION_DURATION.observe(start.elapsed().as_secs_f64());

        match (outcome, teardown) {
            (Err(e), teardown) => {
                if let Err(cleanup) = teardown {
                    warn!(error = %cleanup, "teardown after failed attempt also failed");
                }
                Err(e)
            }
            (Ok(_), Err(cleanup)) => Err(cleanup),
            (Ok(result), Ok(())) => {
                debug!(exit_code = result.exit_code, elapsed_ms = start.elapsed().as_millis() as u64, "attempt finished");
                Ok(result)
            }
        }
    }

    /// Create and start the attempt's container
    async fn provision(
        &self,
        attempt: &Attempt,
        host_dir: PathBuf,
    ) -> Result<ContainerHandle, ExecutorError> {
        let spec = ContainerSpec::idle(&attempt.container_name, &attempt.image, host_dir);

        debug!("creating container");
        let id = match self.runtime.create_container(&spec).await {
            Ok(id) => id,
            Err(e) => {
                // A failed create can still leave a half-made container behind
                if let Err(cleanup) = self.runtime.remove_container(&spec.name, true).await {
                    warn!(error = %cleanup, "cleanup after failed create failed");
                }
                return Err(ExecutorError::runtime(Stage::Create, e));
            }
        };

        let mut handle = ContainerHandle::new(spec.name, id, Arc::clone(&self.runtime));

        debug!("starting container");
        if let Err(e) = self.runtime.start_container(&handle.id).await {
            handle.mark_failed(e.to_string());
            if let Err(cleanup) = handle.abort().await {
                warn!(error = %cleanup, "cleanup after failed start failed");
            }
            return Err(ExecutorError::runtime(Stage::Start, e));
        }

        handle.mark_running();
        Ok(handle)
    }

    /// Run every command of the plan; stops at the first non-zero exit
    async fn run_plan(
        &self,
        container: &ContainerHandle,
        attempt: &Attempt,
    ) -> Result<ExecutionResult, ExecutorError> {
        let commands = generate_commands(&attempt.workdir)?;
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&attempt.log_file)
            .await
            .map_err(|source| ExecutorError::LogFile {
                path: attempt.log_file.clone(),
                source,
            })?;

        if commands.is_empty() {
            info!("no runnable scripts in workdir");
        }

        let mut result = ExecutionResult::default();
        for command in commands {
            info!(command = %command, "running command in container");

            let exec_id = self
                .runtime
                .create_exec(
                    &container.id,
                    vec!["/bin/sh".to_string(), "-c".to_string(), command.clone()],
                    CONTAINER_MOUNT_PATH,
                )
                .await
                .map_err(|e| ExecutorError::runtime(Stage::ExecCreate, e))?;

            let mut output = self
                .runtime
                .attach_exec(&exec_id)
                .await
                .map_err(|e| ExecutorError::runtime(Stage::ExecAttach, e))?;

            let mut buffer = Vec::new();
            while let Some(chunk) = output.next().await {
                let chunk = chunk.map_err(|e| ExecutorError::runtime(Stage::OutputCopy, e))?;
                log.write_all(&chunk)
                    .await
                    .map_err(|e| ExecutorError::runtime(Stage::OutputCopy, e.into()))?;
                buffer.extend_from_slice(&chunk);
            }
            log.flush()
                .await
                .map_err(|e| ExecutorError::runtime(Stage::OutputCopy, e.into()))?;

            let exit_code = self
                .runtime
                .exec_exit_code(&exec_id)
                .await
                .map_err(|e| ExecutorError::runtime(Stage::ExecInspect, e))?;

            result = ExecutionResult {
                exit_code,
                output: String::from_utf8_lossy(&buffer).into_owned(),
                canceled: false,
            };

            if exit_code != 0 {
                info!(
                    command = %command,
                    exit_code,
                    log = %attempt.log_file.display(),
                    "command exited with non-zero status"
                );
                break;
            }
        }

        Ok(result)
    }
}

/// Create the workdir and return its absolute path for the bind mount
async fn prepare_workdir(workdir: &Path) -> Result<PathBuf, ExecutorError> {
    let workdir_err = |source| ExecutorError::Workdir {
        path: workdir.to_path_buf(),
        source,
    };
    tokio::fs::create_dir_all(workdir).await.map_err(workdir_err)?;
    tokio::fs::canonicalize(workdir).await.map_err(workdir_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canceled_sentinel() {
        let result = ExecutionResult::canceled();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.output, "canceled");
        assert!(!result.succeeded());
    }

    #[test]
    fn test_empty_result_is_success() {
        let result = ExecutionResult::default();
        assert!(result.succeeded());
        assert!(result.output.is_empty());
    }

    #[test]
    fn test_stage_names() {
        assert_eq!(Stage::ExecCreate.to_string(), "exec-create");
        assert_eq!(Stage::OutputCopy.as_str(), "output-copy");
        let err = ExecutorError::runtime(Stage::Start, RuntimeError::Other("boom".into()));
        assert_eq!(err.stage(), Some(Stage::Start));
        assert_eq!(err.to_string(), "container runtime failed during start: boom");
    }

    #[tokio::test]
    async fn test_prepare_workdir_is_absolute() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let host = prepare_workdir(&nested).await.unwrap();
        assert!(host.is_absolute());
        assert!(nested.is_dir());
    }
}
