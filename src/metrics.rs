//! Prometheus metrics
//!
//! All metrics live in the default registry and are exposed in the text
//! format at `GET /metrics` by [`serve_metrics`].

use std::convert::Infallible;
use std::net::SocketAddr;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter_vec, register_int_gauge,
    Encoder, Histogram, HistogramVec, IntCounterVec, IntGauge, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

lazy_static! {
    // ─────────────────────────────────────────────────────────────────────────────
    // Requests & Tasks
    // ─────────────────────────────────────────────────────────────────────────────

    /// Finished ExecuteCode calls by final gRPC status code ("ok", "aborted", ...)
    pub static ref GRPC_REQUESTS: IntCounterVec = register_int_counter_vec!(
        "codexec_grpc_requests_total",
        "ExecuteCode calls by final status",
        &["status"]
    ).expect("failed to register GRPC_REQUESTS metric");

    /// ExecuteCode calls currently streaming
    pub static ref REQUESTS_IN_FLIGHT: IntGauge = register_int_gauge!(
        "codexec_requests_in_flight",
        "ExecuteCode calls currently in progress"
    ).expect("failed to register REQUESTS_IN_FLIGHT metric");

    /// Tasks by outcome: terminated, retries_exhausted, failed, canceled, skipped
    pub static ref TASKS: IntCounterVec = register_int_counter_vec!(
        "codexec_tasks_total",
        "Tasks processed by workers, by outcome",
        &["outcome"]
    ).expect("failed to register TASKS metric");

    /// Wall-clock time a worker spends on one task
    pub static ref TASK_DURATION: Histogram = register_histogram!(
        "codexec_task_duration_seconds",
        "Time from worker pickup to task completion",
        vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]
    ).expect("failed to register TASK_DURATION metric");

    /// Workers currently running a task
    pub static ref WORKERS_BUSY: IntGauge = register_int_gauge!(
        "codexec_workers_busy",
        "Workers currently running a task"
    ).expect("failed to register WORKERS_BUSY metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Agent & Model
    // ─────────────────────────────────────────────────────────────────────────────

    /// Execution attempts by result: success, nonzero_exit, extract_error, sandbox_error
    pub static ref AGENT_ATTEMPTS: IntCounterVec = register_int_counter_vec!(
        "codexec_agent_attempts_total",
        "Execution attempts made by the agent, by result",
        &["result"]
    ).expect("failed to register AGENT_ATTEMPTS metric");

    /// Duration of one streamed completion, by model
    pub static ref LLM_CALL_DURATION: HistogramVec = register_histogram_vec!(
        "codexec_llm_call_duration_seconds",
        "Time to receive a full completion",
        &["model"],
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
    ).expect("failed to register LLM_CALL_DURATION metric");

    /// Tokens of model output, by model
    pub static ref LLM_TOKENS: IntCounterVec = register_int_counter_vec!(
        "codexec_llm_tokens_total",
        "Completion tokens produced, by model",
        &["model"]
    ).expect("failed to register LLM_TOKENS metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Sandbox
    // ─────────────────────────────────────────────────────────────────────────────

    /// Sandbox containers currently running
    pub static ref CONTAINERS_RUNNING: IntGauge = register_int_gauge!(
        "codexec_containers_running",
        "Sandbox containers currently running"
    ).expect("failed to register CONTAINERS_RUNNING metric");

    /// Time from container creation to removal
    pub static ref CONTAINER_LIFETIME: Histogram = register_histogram!(
        "codexec_container_lifetime_seconds",
        "Lifetime of sandbox containers",
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0]
    ).expect("failed to register CONTAINER_LIFETIME metric");

    /// Time spent in one executor run, including setup and teardown
    pub static ref EXECUTION_DURATION: Histogram = register_histogram!(
        "codexec_execution_duration_seconds",
        "Duration of one execution attempt",
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0]
    ).expect("failed to register EXECUTION_DURATION metric");

    /// Container runtime failures by stage (create, start, exec-create, ...)
    pub static ref RUNTIME_ERRORS: IntCounterVec = register_int_counter_vec!(
        "codexec_runtime_errors_total",
        "Container runtime failures, by stage",
        &["stage"]
    ).expect("failed to register RUNTIME_ERRORS metric");
}

/// Render every registered metric in the Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

async fn handle(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    if req.uri().path() != "/metrics" {
        let mut response = Response::new(Full::new(Bytes::from_static(b"not found\n")));
        *response.status_mut() = StatusCode::NOT_FOUND;
        return Ok(response);
    }

    let mut response = match encode_metrics() {
        Ok(body) => Response::new(Full::new(Bytes::from(body))),
        Err(e) => {
            let mut response = Response::new(Full::new(Bytes::from(e.to_string())));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            return Ok(response);
        }
    };
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    Ok(response)
}

/// Serve `GET /metrics` on `addr` until `shutdown` is cancelled
pub async fn serve_metrics(addr: SocketAddr, shutdown: CancellationToken) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "metrics endpoint listening");

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted?,
        };

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle))
                .await
            {
                debug!(%peer, error = %e, "metrics connection error");
            }
        });
    }

    info!("metrics endpoint stopped");
    Ok(())
}

/// Spawn [`serve_metrics`] and log instead of failing if it stops with an error
pub fn spawn_metrics_server(addr: SocketAddr, shutdown: CancellationToken) {
    tokio::spawn(async move {
        if let Err(e) = serve_metrics(addr, shutdown).await {
            warn!(%addr, error = %e, "metrics endpoint failed");
        }
    });
}
