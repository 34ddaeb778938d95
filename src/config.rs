//! Server configuration
//!
//! Plain structs with defaults; the binary fills them from command-line
//! flags and environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;

use crate::agent::DEFAULT_SYSTEM_PROMPT;

/// Per-request values used when the client leaves a field empty
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDefaults {
    /// Image for sandbox containers
    pub image: String,
    /// Model name passed to the language model
    pub model: String,
    /// Attempts per task
    pub max_retry: u32,
    /// System prompt opening every conversation
    pub system_prompt: String,
}

impl Default for TaskDefaults {
    fn default() -> Self {
        Self {
            image: "python:3.12-slim".to_string(),
            model: "gpt-4o-mini".to_string(),
            max_retry: 5,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

/// Configuration for the codexec server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// gRPC listen address
    pub listen_addr: SocketAddr,
    /// Number of tasks run concurrently (= max live sandboxes)
    pub workers: usize,
    /// Parent directory of every task workdir
    pub coding_root: PathBuf,
    /// Keep task workdirs and output logs after the task ends
    pub retain_workdirs: bool,
    /// Root of the OpenAI-compatible API
    pub llm_base_url: String,
    /// Bearer token for the model server
    pub llm_api_key: Option<String>,
    /// Seconds `docker stop` waits before killing a sandbox
    pub stop_timeout_secs: i64,
    /// Values applied to incomplete requests
    pub defaults: TaskDefaults,
    /// Prometheus endpoint address; `None` disables it
    pub metrics_addr: Option<SocketAddr>,
    /// OTLP collector URL; `None` disables span export
    pub otlp_endpoint: Option<String>,
    /// JSON log lines instead of text
    pub json_logs: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 50051)),
            workers: 2,
            coding_root: PathBuf::from("./coding"),
            retain_workdirs: false,
            llm_base_url: "https://api.openai.com/v1".to_string(),
            llm_api_key: None,
            stop_timeout_secs: 2,
            defaults: TaskDefaults::default(),
            metrics_addr: None,
            otlp_endpoint: None,
            json_logs: false,
        }
    }
}
