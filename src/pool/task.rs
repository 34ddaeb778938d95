//! The unit of work handed from the gateway to a worker

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How a task ended, as reported back to the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The model declared the task done
    Terminated { attempts: u32 },
    /// Every allowed attempt ran without the model declaring success
    RetriesExhausted { attempts: u32 },
    /// The task could not continue (model unreachable, ...)
    Failed { reason: String },
}

/// One-shot completion signal
///
/// Fires at most once: [`CompletionSignal::fire`] consumes it. A signal
/// dropped without firing tells the gateway the task was cancelled.
#[derive(Debug)]
pub struct CompletionSignal(oneshot::Sender<TaskOutcome>);

impl CompletionSignal {
    pub fn channel() -> (Self, oneshot::Receiver<TaskOutcome>) {
        let (tx, rx) = oneshot::channel();
        (Self(tx), rx)
    }

    /// Report the outcome; returns false if nobody is listening anymore
    pub fn fire(self, outcome: TaskOutcome) -> bool {
        self.0.send(outcome).is_ok()
    }
}

/// Line sink bound to the client stream of one task
///
/// Every line is mirrored to `tracing` and, when attached, forwarded in
/// order to the client. Sending never blocks, so it can be called from
/// synchronous streaming callbacks.
#[derive(Debug, Clone)]
pub struct TaskLogger {
    task_id: u64,
    tx: Option<mpsc::UnboundedSender<String>>,
}

impl TaskLogger {
    /// A logger whose lines can be read from the returned receiver
    pub fn channel(task_id: u64) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { task_id, tx: Some(tx) }, rx)
    }

    /// A logger that only writes to `tracing`
    pub fn detached(task_id: u64) -> Self {
        Self { task_id, tx: None }
    }

    pub fn line(&self, line: impl Into<String>) {
        let mut line = line.into();
        debug!(task_id = self.task_id, "{}", line);
        if let Some(tx) = &self.tx {
            line.push('\n');
            // receiver gone means the client left; cancellation handles that
            let _ = tx.send(line);
        }
    }
}

/// A coding task, owned by the gateway until submitted and by a worker after
#[derive(Debug)]
pub struct Task {
    /// Unique per request
    pub id: u64,
    pub system_prompt: String,
    pub user_prompt: String,
    /// Image every attempt's container runs
    pub image: String,
    /// Client-supplied hint folded into the workdir name
    pub workdir_hint: String,
    /// Maximum number of execution attempts
    pub max_retry: u32,
    /// Model name passed to the language model
    pub model: String,
    /// Child of the server shutdown token; cancelled on client disconnect
    pub cancel: CancellationToken,
    pub completion: CompletionSignal,
    pub logger: TaskLogger,
}
