//! codexec server
//!
//! Connects to Docker and the model server, starts the worker pool and
//! serves `codexec.CoderService` until Ctrl-C.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use codexec::config::{ServerConfig, TaskDefaults};
use codexec::metrics::spawn_metrics_server;
use codexec::pool::{IdSource, UuidIds};
use codexec::sandbox::ContainerRuntime;
use codexec::{
    Agent, AgentWorker, ChatClient, CoderGateway, ContainerExecutor, DockerRuntime, WorkerPool,
};

#[derive(Parser, Debug)]
#[command(name = "codexec", version, about = "Sandboxed LLM code execution over gRPC")]
struct Args {
    /// gRPC listen address
    #[arg(long, env = "CODEXEC_LISTEN", default_value = "0.0.0.0:50051")]
    listen: SocketAddr,

    /// Number of tasks executed concurrently
    #[arg(long, env = "CODEXEC_WORKERS", default_value_t = 2)]
    workers: usize,

    /// Directory under which task workdirs are created
    #[arg(long, env = "CODEXEC_CODING_ROOT", default_value = "./coding")]
    coding_root: PathBuf,

    /// Keep task workdirs and output logs after each task
    #[arg(long, env = "CODEXEC_RETAIN_WORKDIRS")]
    retain_workdirs: bool,

    /// Root URL of the OpenAI-compatible chat API
    #[arg(long, env = "CODEXEC_LLM_URL", default_value = "https://api.openai.com/v1")]
    llm_url: String,

    /// API key for the chat API
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Model used when a request names none
    #[arg(long, env = "CODEXEC_MODEL")]
    model: Option<String>,

    /// Image used when a request names none
    #[arg(long, env = "CODEXEC_IMAGE")]
    image: Option<String>,

    /// Attempts per task when a request sets none
    #[arg(long, env = "CODEXEC_MAX_RETRY")]
    max_retry: Option<u32>,

    /// Seconds `docker stop` waits before killing a sandbox
    #[arg(long, env = "CODEXEC_STOP_TIMEOUT", default_value_t = 2)]
    stop_timeout: i64,

    /// Serve Prometheus metrics on this address
    #[arg(long, env = "CODEXEC_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    /// Export spans to this OTLP endpoint
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,

    /// Log as JSON
    #[arg(long, env = "CODEXEC_JSON_LOGS")]
    json_logs: bool,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        let base = ServerConfig::default();
        let defaults = TaskDefaults {
            image: self.image.unwrap_or(base.defaults.image),
            model: self.model.unwrap_or(base.defaults.model),
            max_retry: self.max_retry.unwrap_or(base.defaults.max_retry),
            system_prompt: base.defaults.system_prompt,
        };
        ServerConfig {
            listen_addr: self.listen,
            workers: self.workers,
            coding_root: self.coding_root,
            retain_workdirs: self.retain_workdirs,
            llm_base_url: self.llm_url,
            llm_api_key: self.api_key,
            stop_timeout_secs: self.stop_timeout,
            defaults,
            metrics_addr: self.metrics_addr,
            otlp_endpoint: self.otlp_endpoint,
            json_logs: self.json_logs,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Args::parse().into_config();

    codexec::tracing::init_tracing("codexec", config.otlp_endpoint.as_deref(), config.json_logs)
        .map_err(|e| anyhow::anyhow!(e))
        .context("failed to initialize tracing")?;

    let docker = DockerRuntime::connect_local()
        .context("failed to connect to Docker")?
        .with_stop_timeout(config.stop_timeout_secs);
    if let Err(e) = docker.ping().await {
        warn!(error = %e, "Docker daemon did not answer ping; sandboxes will fail until it does");
    }

    tokio::fs::create_dir_all(&config.coding_root)
        .await
        .with_context(|| format!("failed to create {}", config.coding_root.display()))?;

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(docker);
    let llm = Arc::new(ChatClient::new(&config.llm_base_url).with_api_key(config.llm_api_key.clone()));
    let agent = Agent::new(llm, Arc::new(ContainerExecutor::new(runtime)));
    let ids: Arc<dyn IdSource> = Arc::new(UuidIds::new());
    let worker = AgentWorker::new(agent, Arc::clone(&ids), &config.coding_root, config.retain_workdirs);
    let pool = Arc::new(WorkerPool::new(config.workers, Arc::new(worker)));

    let shutdown = CancellationToken::new();
    if let Some(addr) = config.metrics_addr {
        spawn_metrics_server(addr, shutdown.clone());
    }

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            return;
        }
        info!("shutdown requested, cancelling tasks");
        signal_token.cancel();
    });

    println!(
        "[INFO] codexec listening on {} ({} workers, model {}, image {})",
        config.listen_addr, config.workers, config.defaults.model, config.defaults.image
    );

    let gateway = CoderGateway::new(Arc::clone(&pool), ids, config.defaults.clone(), shutdown.clone());
    codexec::grpc::serve(config.listen_addr, gateway, shutdown.clone())
        .await
        .context("gRPC server failed")?;

    shutdown.cancel();
    pool.close().await;
    codexec::tracing::shutdown_tracing();
    Ok(())
}
