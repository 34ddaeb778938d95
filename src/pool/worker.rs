//! Per-task work done by a pool worker
//!
//! [`AgentWorker`] turns a [`Task`] into an agent run: it picks the container
//! name and workdir, runs the agent, maps the outcome onto the completion
//! signal and cleans the workdir up afterwards.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{info, warn};

use super::ids::IdSource;
use super::task::{Task, TaskOutcome};
use super::TaskRunner;
use crate::agent::{Agent, AgentContext, AgentOutcome};
use crate::metrics::{TASKS, TASK_DURATION};

/// Longest client hint kept in a workdir name
const MAX_HINT_LEN: usize = 32;

/// Runs tasks through an [`Agent`]
pub struct AgentWorker {
    agent: Agent,
    ids: Arc<dyn IdSource>,
    coding_root: PathBuf,
    retain_workdirs: bool,
}

impl AgentWorker {
    /// # Arguments
    /// * `agent` - Agent shared by every worker of the pool
    /// * `ids` - Source of container names
    /// * `coding_root` - Parent directory of all task workdirs
    /// * `retain_workdirs` - Keep workdirs (and their output logs) after the task
    pub fn new(
        agent: Agent,
        ids: Arc<dyn IdSource>,
        coding_root: impl Into<PathBuf>,
        retain_workdirs: bool,
    ) -> Self {
        Self {
            agent,
            ids,
            coding_root: coding_root.into(),
            retain_workdirs,
        }
    }

    fn context(&self, task: &Task) -> AgentContext {
        let container_name = self.ids.container_name();
        let workdir = self.coding_root.join(workdir_name(&task.workdir_hint, &container_name));
        AgentContext {
            container_name,
            workdir,
        }
    }
}

#[async_trait]
impl TaskRunner for AgentWorker {
    async fn run_task(&self, worker_id: usize, task: Task) {
        if task.cancel.is_cancelled() {
            info!(worker = worker_id, task_id = task.id, "client disconnected, skipping task");
            TASKS.with_label_values(&["skipped"]).inc();
            return;
        }

        let ctx = self.context(&task);
        info!(
            worker = worker_id,
            task_id = task.id,
            container = %ctx.container_name,
            workdir = %ctx.workdir.display(),
            "worker picked up task"
        );

        let start = Instant::now();
        let run = self.agent.run(&task, &ctx).await;
        TASK_DURATION.observe(start.elapsed().as_secs_f64());

        task.logger.line(format!(
            "[CODER] finished in {:.2}s, {} attempts, {} tokens",
            run.stats.elapsed.as_secs_f64(),
            run.stats.attempts,
            run.stats.tokens
        ));

        let attempts = run.stats.attempts;
        let outcome = match run.outcome {
            AgentOutcome::Terminated { .. } => Some(TaskOutcome::Terminated { attempts }),
            AgentOutcome::GaveUp { .. } => Some(TaskOutcome::RetriesExhausted { attempts }),
            AgentOutcome::Failed(e) => Some(TaskOutcome::Failed {
                reason: e.to_string(),
            }),
            AgentOutcome::Canceled => None,
        };

        let Task { id, completion, .. } = task;
        match outcome {
            Some(outcome) => {
                TASKS.with_label_values(&[outcome_label(&outcome)]).inc();
                if !completion.fire(outcome) {
                    info!(task_id = id, "gateway stopped listening before completion");
                }
            }
            None => {
                TASKS.with_label_values(&["canceled"]).inc();
                drop(completion);
            }
        }

        if !self.retain_workdirs {
            if let Err(e) = tokio::fs::remove_dir_all(&ctx.workdir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(task_id = id, workdir = %ctx.workdir.display(), error = %e, "failed to remove workdir");
                }
            }
        }
    }
}

fn outcome_label(outcome: &TaskOutcome) -> &'static str {
    match outcome {
        TaskOutcome::Terminated { .. } => "terminated",
        TaskOutcome::RetriesExhausted { .. } => "retries_exhausted",
        TaskOutcome::Failed { .. } => "failed",
    }
}

/// `{hint}-{name}` with the hint reduced to `[A-Za-z0-9_-]`, or just `{name}`
pub fn workdir_name(hint: &str, container_name: &str) -> String {
    let hint: String = hint
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(MAX_HINT_LEN)
        .collect();
    let hint = hint.trim_matches('-');
    if hint.is_empty() {
        container_name.to_string()
    } else {
        format!("{}-{}", hint, container_name)
    }
}
