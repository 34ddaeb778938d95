//! Container Handle - one sandbox container for the span of one attempt
//!
//! Tracks the container through its lifecycle:
//! Creating -> Running -> Stopping -> Removed (or Failed)
//!
//! A handle must be torn down with [`ContainerHandle::release`] or
//! [`ContainerHandle::abort`]. If it is dropped without either (the attempt
//! future was aborted mid-flight), `Drop` schedules a forced removal.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::executor::{ExecutorError, Stage};
use super::runtime::ContainerRuntime;
use crate::metrics::{CONTAINERS_RUNNING, CONTAINER_LIFETIME};

/// Status of a sandbox container
#[derive(Debug, Clone, PartialEq)]
pub enum ContainerStatus {
    /// Container is created but not yet started
    Creating,
    /// Container is started and accepts exec calls
    Running,
    /// Teardown is in progress
    Stopping,
    /// Container is gone from the runtime
    Removed,
    /// Teardown or start failed
    Failed(String),
}

/// A created sandbox container with guaranteed teardown
pub struct ContainerHandle {
    /// Container name (unique per attempt)
    pub name: String,
    /// Runtime-assigned container id
    pub id: String,
    /// Current status of this container
    pub status: ContainerStatus,
    /// When the container was created
    pub created_at: Instant,
    runtime: Arc<dyn ContainerRuntime>,
    released: bool,
}

impl ContainerHandle {
    /// Wrap a freshly created container
    pub fn new(name: String, id: String, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            name,
            id,
            status: ContainerStatus::Creating,
            created_at: Instant::now(),
            runtime,
            released: false,
        }
    }

    /// Mark container as running (started successfully)
    pub fn mark_running(&mut self) {
        if self.status != ContainerStatus::Running {
            CONTAINERS_RUNNING.inc();
        }
        self.status = ContainerStatus::Running;
    }

    /// Mark container as failed
    pub fn mark_failed(&mut self, error: String) {
        self.leave_running();
        self.status = ContainerStatus::Failed(error);
    }

    /// Check if the container accepts exec calls
    pub fn is_running(&self) -> bool {
        matches!(self.status, ContainerStatus::Running)
    }

    /// Get time since the container was created
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Graceful teardown: stop, then remove
    ///
    /// If the stop fails the container is force-removed and the stop error is
    /// still reported. If a plain remove fails a forced remove is tried once.
    pub async fn release(mut self) -> Result<(), ExecutorError> {
        self.leave_running();
        self.status = ContainerStatus::Stopping;
        self.released = true;

        if let Err(stop_err) = self.runtime.stop_container(&self.id).await {
            warn!(container = %self.name, error = %stop_err, "stop failed, forcing removal");
            return match self.runtime.remove_container(&self.id, true).await {
                Ok(()) => {
                    self.finish(ContainerStatus::Removed);
                    Err(ExecutorError::runtime(Stage::Stop, stop_err))
                }
                Err(remove_err) => {
                    self.finish(ContainerStatus::Failed(remove_err.to_string()));
                    Err(ExecutorError::runtime(Stage::Remove, remove_err))
                }
            };
        }

        if let Err(first) = self.runtime.remove_container(&self.id, false).await {
            debug!(container = %self.name, error = %first, "remove failed, retrying with force");
            if let Err(remove_err) = self.runtime.remove_container(&self.id, true).await {
                self.finish(ContainerStatus::Failed(remove_err.to_string()));
                return Err(ExecutorError::runtime(Stage::Remove, remove_err));
            }
        }

        self.finish(ContainerStatus::Removed);
        Ok(())
    }

    /// Abortive teardown: forced removal without a stop
    pub async fn abort(mut self) -> Result<(), ExecutorError> {
        self.leave_running();
        self.status = ContainerStatus::Stopping;
        self.released = true;

        match self.runtime.remove_container(&self.id, true).await {
            Ok(()) => {
                self.finish(ContainerStatus::Removed);
                Ok(())
            }
            Err(e) => {
                self.finish(ContainerStatus::Failed(e.to_string()));
                Err(ExecutorError::runtime(Stage::Remove, e))
            }
        }
    }

    fn finish(&mut self, status: ContainerStatus) {
        CONTAINER_LIFETIME.observe(self.age().as_secs_f64());
        debug!(container = %self.name, status = ?status, "container torn down");
        self.status = status;
    }

    fn leave_running(&mut self) {
        if self.status == ContainerStatus::Running {
            CONTAINERS_RUNNING.dec();
        }
    }
}

impl Drop for ContainerHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.leave_running();

        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            warn!(container = %self.name, "handle dropped outside a runtime, container leaked");
            return;
        };

        warn!(container = %self.name, "handle dropped without teardown, forcing removal");
        let runtime = Arc::clone(&self.runtime);
        let id = self.id.clone();
        let name = self.name.clone();
        rt.spawn(async move {
            if let Err(e) = runtime.remove_container(&id, true).await {
                warn!(container = %name, error = %e, "forced removal after drop failed");
            }
        });
    }
}

impl std::fmt::Debug for ContainerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerHandle")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("status", &self.status)
            .field("age", &self.age())
            .finish()
    }
}
