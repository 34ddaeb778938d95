//! Agent Controller - the generate / execute / correct loop of one task
//!
//! The Agent drives a conversation with the language model, runs whatever
//! code the model produces in a fresh sandbox, and feeds the result back
//! until the model answers with the termination marker or the attempt
//! budget is spent.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, info_span, warn, Instrument};

use crate::codeblocks::{extract_and_save, ExtractError};
use crate::llm::{Conversation, LanguageModel, LlmError};
use crate::metrics::{AGENT_ATTEMPTS, LLM_TOKENS};
use crate::pool::Task;
use crate::sandbox::{Attempt, ContainerExecutor, ExecutionResult, ExecutorError};

/// The model ends a task by including this word in its answer
pub const TERMINATION_MARKER: &str = "TERMINATE";

/// Printed between turns in the client stream
const SEPARATOR: &str = "--------------------------------------------------------------------------------";

/// System prompt used when the request does not carry one
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are a helpful AI assistant that solves tasks by writing code.

Your code is saved to files and executed for you inside a Linux container; you cannot run it yourself.
- Put every piece of code in a fenced code block tagged with its language (```python, ```sh, ...).
- Only shell scripts are executed: include a ```sh block that runs the other files, e.g. `python3 main.py`.
- To choose a file name, put `# filename: <name>` on the first line of the block.
- Write complete code; do not ask the user to modify it.
- After each run you receive the exit code and output. If it failed, fix the code and send it again.
- When the output shows the task is solved, reply with TERMINATE and nothing else."#;

/// Where a task's attempts run, assigned by the worker
#[derive(Debug, Clone)]
pub struct AgentContext {
    /// Base container name; attempt N runs in `{container_name}-a{N}`
    pub container_name: String,
    /// Task directory that receives generated files
    pub workdir: PathBuf,
}

impl AgentContext {
    /// Combined output log shared by all attempts of the task
    pub fn log_file(&self) -> PathBuf {
        self.workdir.join(format!("{}_output.log", self.container_name))
    }

    fn attempt(&self, number: u32, image: &str) -> Attempt {
        Attempt {
            number,
            container_name: format!("{}-a{}", self.container_name, number),
            image: image.to_string(),
            workdir: self.workdir.clone(),
            log_file: self.log_file(),
        }
    }
}

/// Counters collected over one run; they never steer the loop
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Instrumentation {
    /// Tokens of model output, counted for the task's model
    pub tokens: usize,
    /// Wall-clock time of the whole run
    pub elapsed: Duration,
    /// Execution attempts made
    pub attempts: u32,
    /// Completions requested from the model
    pub llm_calls: u32,
}

/// What happened in one execution attempt
#[derive(Debug)]
pub enum AttemptReport {
    /// The plan ran; exit code and output are feedback for the model
    Executed(ExecutionResult),
    /// The model's code blocks could not be saved
    ExtractFailed(ExtractError),
    /// The sandbox itself failed
    SandboxFailed(ExecutorError),
}

impl AttemptReport {
    /// Prompt sent back to the model before the next turn
    pub fn correction(&self) -> String {
        match self {
            AttemptReport::Executed(result) if result.exit_code != 0 => format!(
                "The code exited with exit_code {}. Give me another example with modification, stdout received : {}",
                result.exit_code, result.output
            ),
            AttemptReport::Executed(result) => format!(
                "exit_code - {}, stdout received : {}",
                result.exit_code, result.output
            ),
            AttemptReport::ExtractFailed(e) => format!(
                "Saving your code blocks failed: {}. Give me another example with modification.",
                e
            ),
            AttemptReport::SandboxFailed(e) => format!(
                "The execution environment failed before your code could finish: {}. Give me another example.",
                e
            ),
        }
    }

    fn metric_label(&self) -> &'static str {
        match self {
            AttemptReport::Executed(r) if r.exit_code == 0 => "success",
            AttemptReport::Executed(_) => "nonzero_exit",
            AttemptReport::ExtractFailed(_) => "extract_error",
            AttemptReport::SandboxFailed(_) => "sandbox_error",
        }
    }
}

/// Error type for agent operations
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("language model call failed: {0}")]
    Llm(#[from] LlmError),
}

/// How the loop ended
#[derive(Debug)]
pub enum AgentOutcome {
    /// The model answered with the termination marker
    Terminated { response: String },
    /// All attempts ran without termination
    GaveUp { last: Option<AttemptReport> },
    /// The task was cancelled
    Canceled,
    /// The model could not be reached
    Failed(AgentError),
}

/// Result of an agent run
#[derive(Debug)]
pub struct AgentRun {
    pub outcome: AgentOutcome,
    pub conversation: Conversation,
    pub stats: Instrumentation,
}

/// Drives tasks through the model and the sandbox
pub struct Agent {
    llm: Arc<dyn LanguageModel>,
    executor: Arc<ContainerExecutor>,
}

impl Agent {
    /// Create a new agent
    ///
    /// # Arguments
    /// * `llm` - Language model that writes the code
    /// * `executor` - Sandbox executor that runs it
    pub fn new(llm: Arc<dyn LanguageModel>, executor: Arc<ContainerExecutor>) -> Self {
        Self { llm, executor }
    }

    /// Run a task to completion
    ///
    /// Never panics or returns early on errors: every way the loop can end is
    /// an [`AgentOutcome`].
    pub async fn run(&self, task: &Task, ctx: &AgentContext) -> AgentRun {
        let span = info_span!(
            "agent_task",
            task_id = task.id,
            model = %task.model,
            container = %ctx.container_name,
        );
        self.run_loop(task, ctx).instrument(span).await
    }

    async fn run_loop(&self, task: &Task, ctx: &AgentContext) -> AgentRun {
        let start = Instant::now();
        let logger = &task.logger;
        let max_attempts = task.max_retry.max(1);
        let mut conversation = Conversation::new(&task.system_prompt, &task.user_prompt);
        let mut stats = Instrumentation::default();

        info!(max_attempts, "running task");

        let outcome = loop {
            if task.cancel.is_cancelled() {
                info!("agent stopping due to cancel request");
                break AgentOutcome::Canceled;
            }

            logger.line(SEPARATOR);
            logger.line("[CODER] : Thinking ...");

            let response = match self.think(task, &conversation, &mut stats).await {
                Some(Ok(response)) => response,
                Some(Err(e)) => {
                    warn!(error = %e, "model call failed");
                    logger.line(format!("[CODER] model call failed: {}", e));
                    break AgentOutcome::Failed(e);
                }
                None => {
                    info!("agent stopping due to cancel request");
                    break AgentOutcome::Canceled;
                }
            };

            if response.contains(TERMINATION_MARKER) {
                info!(attempts = stats.attempts, "model terminated the task");
                break AgentOutcome::Terminated { response };
            }

            conversation.push_assistant(response.as_str());
            stats.attempts += 1;
            let report = self.attempt(task, ctx, &response, stats.attempts).await;
            AGENT_ATTEMPTS.with_label_values(&[report.metric_label()]).inc();

            let canceled = matches!(&report, AttemptReport::Executed(r) if r.canceled);
            if canceled || task.cancel.is_cancelled() {
                info!("agent stopping due to cancel request");
                break AgentOutcome::Canceled;
            }

            if stats.attempts >= max_attempts {
                logger.line(format!(
                    "[EXECUTOR] terminating after {} attempts without success",
                    stats.attempts
                ));
                break AgentOutcome::GaveUp { last: Some(report) };
            }

            conversation.push_user(report.correction());
        };

        stats.elapsed = start.elapsed();
        info!(
            attempts = stats.attempts,
            tokens = stats.tokens,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            "task finished"
        );

        AgentRun {
            outcome,
            conversation,
            stats,
        }
    }

    /// One streamed completion, raced against cancellation
    ///
    /// Returns `None` when the task was cancelled before the answer arrived.
    async fn think(
        &self,
        task: &Task,
        conversation: &Conversation,
        stats: &mut Instrumentation,
    ) -> Option<Result<String, AgentError>> {
        let logger = task.logger.clone();
        let mut pending = String::new();
        let mut on_chunk = |chunk: &str| {
            pending.push_str(chunk);
            while let Some(pos) = pending.find('\n') {
                let line: String = pending.drain(..=pos).collect();
                logger.line(line.trim_end_matches(['\r', '\n']));
            }
        };

        stats.llm_calls += 1;
        let result = tokio::select! {
            biased;
            _ = task.cancel.cancelled() => return None,
            result = self.llm.generate(&task.model, conversation.messages(), &mut on_chunk) => result,
        };

        if !pending.is_empty() {
            task.logger.line(pending.as_str());
        }

        Some(result.map_err(AgentError::from).map(|completion| {
            let tokens = self.llm.count_tokens(&task.model, &completion.content);
            stats.tokens += tokens;
            LLM_TOKENS
                .with_label_values(&[task.model.as_str()])
                .inc_by(tokens as u64);
            completion.content
        }))
    }

    /// Save the model's code blocks and run them once
    async fn attempt(
        &self,
        task: &Task,
        ctx: &AgentContext,
        response: &str,
        number: u32,
    ) -> AttemptReport {
        let logger = &task.logger;

        logger.line(format!("[EXECUTOR] [retry: {}]: Extracting code blocks", number));
        let saved = match extract_and_save(response, &ctx.workdir) {
            Ok(saved) => saved,
            Err(e) => {
                warn!(attempt = number, error = %e, "failed to save code blocks");
                logger.line(format!("[EXECUTOR] [retry: {}]: {}", number, e));
                return AttemptReport::ExtractFailed(e);
            }
        };
        for block in &saved {
            logger.line(format!(
                "[EXECUTOR] [retry: {}]: saved {} block to {}",
                number,
                if block.language.is_empty() { "untagged" } else { block.language.as_str() },
                block.path.display()
            ));
        }

        logger.line(format!("[EXECUTOR] [retry: {}]: Executing code blocks", number));
        let attempt = ctx.attempt(number, &task.image);
        match self.executor.run(&attempt, &task.cancel).await {
            Ok(result) => {
                if !result.canceled {
                    logger.line(format!("[EXECUTOR] [retry: {}]: exit_code - {}", number, result.exit_code));
                    logger.line(format!("[EXECUTOR] [retry: {}]: stdout - {}", number, result.output));
                }
                AttemptReport::Executed(result)
            }
            Err(e) => {
                warn!(attempt = number, error = %e, "sandbox failed");
                logger.line(format!("[EXECUTOR] [retry: {}]: sandbox error - {}", number, e));
                AttemptReport::SandboxFailed(e)
            }
        }
    }
}
