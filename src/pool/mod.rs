//! Worker Pool - a fixed set of workers over one rendezvous queue
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Worker Pool                                                 │
//! │                                                              │
//! │  submit(task) ──► queue ──┬──► worker 0 ──► runner.run_task  │
//! │       ▲                   ├──► worker 1 ──► runner.run_task  │
//! │       │                   └──► worker N-1                    │
//! │       └──── accepted ◄────────── (first free worker)         │
//! │                                                              │
//! │  close() ──► queue closed, workers drain and exit, joined    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! `submit` returns only once a worker has taken the task, so callers wait
//! while every worker is busy. With one container per running task, no more
//! than N sandboxes exist at any time. Each task runs in its own tokio task,
//! so a panicking task is logged and the worker moves on.

pub mod ids;
pub mod task;
pub mod worker;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::metrics::WORKERS_BUSY;

pub use ids::{IdSource, SequentialIds, UuidIds};
pub use task::{CompletionSignal, Task, TaskLogger, TaskOutcome};
pub use worker::{workdir_name, AgentWorker};

/// What a worker does with a task it has accepted
#[async_trait]
pub trait TaskRunner: Send + Sync + 'static {
    async fn run_task(&self, worker_id: usize, task: Task);
}

/// Error type for pool operations
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("worker pool is closed")]
    Closed,
}

/// A task waiting for a worker, plus the acknowledgement back to `submit`
struct Submission {
    task: Task,
    accepted: oneshot::Sender<()>,
}

/// Fixed-size pool of long-lived workers
pub struct WorkerPool {
    sender: Mutex<Option<mpsc::Sender<Submission>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl WorkerPool {
    /// Start `size` workers (at least one) that hand tasks to `runner`
    pub fn new(size: usize, runner: Arc<dyn TaskRunner>) -> Self {
        let size = size.max(1);
        let (tx, rx) = mpsc::channel::<Submission>(1);
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..size)
            .map(|worker_id| {
                let rx = Arc::clone(&rx);
                let runner = Arc::clone(&runner);
                tokio::spawn(async move {
                    debug!(worker = worker_id, "worker started");
                    loop {
                        // Only one idle worker waits on the queue at a time;
                        // the lock is released before the task runs.
                        let next = { rx.lock().await.recv().await };
                        let Some(Submission { task, accepted }) = next else {
                            break;
                        };
                        if accepted.send(()).is_err() {
                            debug!(worker = worker_id, task_id = task.id, "submitter went away");
                        }
                        WORKERS_BUSY.inc();
                        let task_id = task.id;
                        let runner = Arc::clone(&runner);
                        let run = tokio::spawn(async move { runner.run_task(worker_id, task).await });
                        if let Err(e) = run.await {
                            warn!(worker = worker_id, task_id, error = %e, "task panicked, worker continues");
                        }
                        WORKERS_BUSY.dec();
                    }
                    debug!(worker = worker_id, "worker exiting");
                })
            })
            .collect();

        info!(workers = size, "worker pool started");
        Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            size,
        }
    }

    /// Number of workers
    pub fn size(&self) -> usize {
        self.size
    }

    /// Hand a task to the next free worker
    ///
    /// Waits while every worker is busy. Fails once the pool is closed.
    pub async fn submit(&self, task: Task) -> Result<(), PoolError> {
        let sender = self.sender.lock().await.clone().ok_or(PoolError::Closed)?;
        let (accepted_tx, accepted_rx) = oneshot::channel();
        sender
            .send(Submission {
                task,
                accepted: accepted_tx,
            })
            .await
            .map_err(|_| PoolError::Closed)?;
        drop(sender);
        accepted_rx.await.map_err(|_| PoolError::Closed)
    }

    /// Stop accepting tasks and wait for every worker to finish
    ///
    /// Tasks already queued are still run. Calling it twice is harmless.
    pub async fn close(&self) {
        self.sender.lock().await.take();
        let workers: Vec<_> = self.workers.lock().await.drain(..).collect();
        for (worker_id, handle) in workers.into_iter().enumerate() {
            if let Err(e) = handle.await {
                warn!(worker = worker_id, error = %e, "worker ended abnormally");
            }
        }
        info!("worker pool closed");
    }
}
