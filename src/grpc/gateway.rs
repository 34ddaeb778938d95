//! Coder Gateway - one streaming gRPC call per coding task
//!
//! # Request Flow
//!
//! ```text
//! Client ──ExecuteCode──► Gateway ── validate, apply defaults
//!                            │
//!                            ├── spawn driver ──submit──► WorkerPool
//!                            │        │                      │
//! Client ◄── log lines ──────┼────────┼──── TaskLogger ◄─────┤ (worker)
//!                            │        │                      │
//!                            │        ├◄── completion ───────┘
//!                            │        └◄── cancel (disconnect / shutdown)
//!                            │
//! Client ◄── OK | ABORTED | INTERNAL | CANCELLED
//! ```

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Code, Request, Response, Status};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::TaskDefaults;
use crate::metrics::{GRPC_REQUESTS, REQUESTS_IN_FLIGHT};
use crate::pool::{CompletionSignal, IdSource, PoolError, Task, TaskLogger, TaskOutcome, WorkerPool};

use super::codexec::coder_service_server::CoderService;
use super::codexec::{CodeRequest, CodeResponse};

/// Buffered chunks per response stream
const STREAM_BUFFER: usize = 100;

/// gRPC service that turns each request into a pool task
#[derive(Clone)]
pub struct CoderGateway {
    pool: Arc<WorkerPool>,
    ids: Arc<dyn IdSource>,
    defaults: TaskDefaults,
    shutdown: CancellationToken,
}

impl CoderGateway {
    /// Create a new gateway
    ///
    /// # Arguments
    /// * `pool` - Worker pool the tasks are submitted to
    /// * `ids` - Source of task ids
    /// * `defaults` - Values for fields a request leaves empty
    /// * `shutdown` - Server-wide token; every task token is a child of it
    pub fn new(
        pool: Arc<WorkerPool>,
        ids: Arc<dyn IdSource>,
        defaults: TaskDefaults,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            pool,
            ids,
            defaults,
            shutdown,
        }
    }

    /// Build a task from a request, filling empty fields from the defaults
    fn task_from_request(
        &self,
        id: u64,
        req: CodeRequest,
        cancel: CancellationToken,
        completion: CompletionSignal,
        logger: TaskLogger,
    ) -> Task {
        let or_default = |value: String, default: &str| {
            if value.trim().is_empty() {
                default.to_string()
            } else {
                value
            }
        };

        Task {
            id,
            system_prompt: or_default(req.system_prompt, &self.defaults.system_prompt),
            user_prompt: req.user_prompt,
            image: or_default(req.docker_image, &self.defaults.image),
            workdir_hint: req.working_directory,
            max_retry: u32::try_from(req.max_retry)
                .ok()
                .filter(|n| *n > 0)
                .unwrap_or(self.defaults.max_retry),
            model: or_default(req.llm_model, &self.defaults.model),
            cancel,
            completion,
            logger,
        }
    }
}

#[tonic::async_trait]
impl CoderService for CoderGateway {
    type ExecuteCodeStream = ReceiverStream<Result<CodeResponse, Status>>;

    async fn execute_code(
        &self,
        request: Request<CodeRequest>,
    ) -> Result<Response<Self::ExecuteCodeStream>, Status> {
        // Correlate client-side logs when the caller sends one
        let trace_id = request
            .metadata()
            .get("x-trace-id")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .unwrap_or_else(|| Uuid::now_v7().to_string());

        let req = request.into_inner();
        if req.user_prompt.trim().is_empty() {
            GRPC_REQUESTS.with_label_values(&["invalid_argument"]).inc();
            return Err(Status::invalid_argument("user_prompt must not be empty"));
        }

        let id = self.ids.next_task_id();
        let cancel = self.shutdown.child_token();
        let (completion, done) = CompletionSignal::channel();
        let (logger, lines) = TaskLogger::channel(id);
        let task = self.task_from_request(id, req, cancel.clone(), completion, logger);

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let span = info_span!("execute_code", task_id = task.id, trace_id = %trace_id);
        info!(parent: &span, model = %task.model, image = %task.image, max_retry = task.max_retry, "request accepted");

        REQUESTS_IN_FLIGHT.inc();
        tokio::spawn(
            drive(Arc::clone(&self.pool), task, done, lines, tx, cancel).instrument(span),
        );

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

/// Submit the task, forward its log lines, and end the stream with its outcome
async fn drive(
    pool: Arc<WorkerPool>,
    task: Task,
    done: oneshot::Receiver<TaskOutcome>,
    mut lines: mpsc::UnboundedReceiver<String>,
    tx: mpsc::Sender<Result<CodeResponse, Status>>,
    cancel: CancellationToken,
) {
    let start = Instant::now();

    // Log lines go out in order; a send error means the client is gone
    let forward_tx = tx.clone();
    let forward_cancel = cancel.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(data) = lines.recv().await {
            if forward_tx.send(Ok(CodeResponse { data })).await.is_err() {
                forward_cancel.cancel();
                break;
            }
        }
    });

    // The response stream is dropped when the client disconnects
    let watch_tx = tx.clone();
    let watch_cancel = cancel.clone();
    let watcher = tokio::spawn(async move {
        watch_tx.closed().await;
        watch_cancel.cancel();
    });

    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        result = async {
            pool.submit(task).await?;
            Ok::<_, PoolError>(done.await)
        } => Some(result),
    };

    let status = match result {
        None => {
            info!("client disconnected or server shutting down, cancelling task");
            Some(Status::cancelled("task cancelled"))
        }
        Some(Err(PoolError::Closed)) => Some(Status::unavailable("worker pool is shut down")),
        Some(Ok(Ok(TaskOutcome::Terminated { attempts }))) => {
            info!(attempts, "task terminated");
            None
        }
        Some(Ok(Ok(TaskOutcome::RetriesExhausted { attempts }))) => {
            info!(attempts, "task gave up");
            Some(Status::aborted(format!(
                "retries exhausted: {} attempts without termination",
                attempts
            )))
        }
        Some(Ok(Ok(TaskOutcome::Failed { reason }))) => {
            warn!(reason = %reason, "task failed");
            Some(Status::internal(reason))
        }
        Some(Ok(Err(_))) if cancel.is_cancelled() => Some(Status::cancelled("task cancelled")),
        Some(Ok(Err(_))) => Some(Status::internal("task ended without reporting an outcome")),
    };

    if status.as_ref().map(Status::code) == Some(Code::Cancelled) {
        forwarder.abort();
    } else if let Err(e) = forwarder.await {
        warn!(error = %e, "log forwarder ended abnormally");
    }

    let label = status.as_ref().map(|s| code_label(s.code())).unwrap_or("ok");
    if let Some(status) = status {
        let _ = tx.send(Err(status)).await;
    }

    // Nothing else may advance on behalf of this request
    cancel.cancel();
    watcher.abort();
    GRPC_REQUESTS.with_label_values(&[label]).inc();
    REQUESTS_IN_FLIGHT.dec();
    info!(status = label, elapsed_ms = start.elapsed().as_millis() as u64, "request finished");
}

fn code_label(code: Code) -> &'static str {
    match code {
        Code::Ok => "ok",
        Code::Cancelled => "cancelled",
        Code::Aborted => "aborted",
        Code::Internal => "internal",
        Code::Unavailable => "unavailable",
        Code::InvalidArgument => "invalid_argument",
        _ => "other",
    }
}
