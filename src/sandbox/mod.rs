//! Sandboxed execution of generated code
//!
//! Every attempt gets its own throwaway container. The executor creates it,
//! runs the plan produced from the task directory, and always tears it down.
//!
//! # Lifecycle
//!
//! ```text
//! ContainerExecutor::run(attempt)
//!        │
//!        ├── cancelled? ──► "canceled" result, no container
//!        │
//!        ├── create ──► start            (ContainerHandle: Creating → Running)
//!        │
//!        ├── for cmd in plan:
//!        │       exec create ──► attach ──► copy output ──► inspect exit code
//!        │       (non-zero exit stops the plan)
//!        │
//!        └── stop ──► remove             (Stopping → Removed)
//!            any runtime error ──► forced remove, ExecutorError::Runtime
//! ```

pub mod docker;
pub mod executor;
pub mod handle;
pub mod runtime;

pub use docker::DockerRuntime;
pub use executor::{Attempt, ContainerExecutor, ExecutionResult, ExecutorError, Stage};
pub use handle::{ContainerHandle, ContainerStatus};
pub use runtime::{
    ContainerRuntime, ContainerSpec, OutputStream, RuntimeError, CONTAINER_MOUNT_PATH, IDLE_COMMAND,
};
