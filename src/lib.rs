//! codexec - LLM-driven code generation with sandboxed Docker execution
//!
//! A client sends a coding task over a streaming gRPC call. A worker drives a
//! conversation with a language model, runs the generated code in a fresh
//! Docker container, feeds exit code and output back to the model, and
//! repeats until the model declares the task done or the attempt budget runs
//! out. Every step is streamed back to the client.
//!
//! # Modules
//!
//! - `codeblocks` - fenced code block extraction and the execution plan
//! - `sandbox` - container runtime seam, Docker runtime, per-attempt executor
//! - `llm` - OpenAI-compatible streaming chat client and token counting
//! - `agent` - the generate / execute / correct loop
//! - `pool` - tasks, completion signals and the bounded worker pool
//! - `grpc` - the `CoderService` gateway and server
//! - `config` - server configuration and request defaults
//! - `metrics` - Prometheus metrics and the `/metrics` endpoint
//! - `tracing` - log and span export setup
//!
//! # Quick Start
//!
//! ```ignore
//! use codexec::{Agent, AgentWorker, ChatClient, ContainerExecutor, DockerRuntime, WorkerPool};
//!
//! let executor = Arc::new(ContainerExecutor::new(Arc::new(DockerRuntime::connect_local()?)));
//! let agent = Agent::new(Arc::new(ChatClient::new("http://localhost:11434/v1")), executor);
//! let worker = AgentWorker::new(agent, ids.clone(), "./coding", false);
//! let pool = WorkerPool::new(2, Arc::new(worker));
//! ```

pub mod agent;
pub mod codeblocks;
pub mod config;
pub mod grpc;
pub mod llm;
pub mod metrics;
pub mod pool;
pub mod sandbox;
pub mod tracing;

// Re-export commonly used types at crate root for convenience
pub use agent::{Agent, AgentContext, AgentOutcome};
pub use config::{ServerConfig, TaskDefaults};
pub use grpc::CoderGateway;
pub use llm::{ChatClient, LanguageModel};
pub use pool::{AgentWorker, Task, TaskOutcome, WorkerPool};
pub use sandbox::{ContainerExecutor, ContainerRuntime, DockerRuntime};
