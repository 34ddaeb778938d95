//! In-memory fakes shared by the integration tests

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use codexec::llm::{ChatMessage, Completion, LanguageModel, LlmError};
use codexec::pool::{CompletionSignal, Task, TaskLogger, TaskOutcome};
use codexec::sandbox::{ContainerRuntime, ContainerSpec, OutputStream, RuntimeError};

// ─────────────────────────────────────────────────────────────────────────────
// Container runtime
// ─────────────────────────────────────────────────────────────────────────────

/// Records every runtime call and answers execs from a script
#[derive(Default)]
pub struct FakeRuntime {
    events: Mutex<Vec<String>>,
    specs: Mutex<Vec<ContainerSpec>>,
    script: Mutex<VecDeque<(i64, String)>>,
    default_exit: Mutex<(i64, String)>,
    exits: Mutex<HashMap<String, i64>>,
    pending_output: Mutex<HashMap<String, String>>,
    fail_at: Mutex<Option<&'static str>>,
    exec_delay: Mutex<Duration>,
    next_exec: AtomicUsize,
    live: AtomicUsize,
    max_live: AtomicUsize,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Exec results handed out in order; afterwards the default is used
    pub fn with_results(results: &[(i64, &str)]) -> Arc<Self> {
        let runtime = Self::default();
        *runtime.script.lock().unwrap() = results.iter().map(|(c, o)| (*c, o.to_string())).collect();
        Arc::new(runtime)
    }

    pub fn set_default_result(&self, exit_code: i64, output: &str) {
        *self.default_exit.lock().unwrap() = (exit_code, output.to_string());
    }

    /// Make one kind of call fail: create, start, exec_create, attach, inspect, stop, remove
    pub fn fail_at(&self, call: &'static str) {
        *self.fail_at.lock().unwrap() = Some(call);
    }

    /// Delay every attach, to keep containers alive for a while
    pub fn set_exec_delay(&self, delay: Duration) {
        *self.exec_delay.lock().unwrap() = delay;
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn specs(&self) -> Vec<ContainerSpec> {
        self.specs.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events().iter().filter(|e| e.starts_with(prefix)).count()
    }

    /// Containers created but not yet removed
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Highest number of containers that existed at the same time
    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    fn check(&self, call: &'static str) -> Result<(), RuntimeError> {
        if *self.fail_at.lock().unwrap() == Some(call) {
            return Err(RuntimeError::Other(format!("injected {} failure", call)));
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        self.record(format!("create:{}", spec.name));
        self.check("create")?;
        self.specs.lock().unwrap().push(spec.clone());
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(live, Ordering::SeqCst);
        Ok(format!("id-{}", spec.name))
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.record(format!("start:{}", id));
        self.check("start")
    }

    async fn create_exec(
        &self,
        _container_id: &str,
        cmd: Vec<String>,
        _working_dir: &str,
    ) -> Result<String, RuntimeError> {
        self.record(format!("exec:{}", cmd.last().cloned().unwrap_or_default()));
        self.check("exec_create")?;
        let exec_id = format!("exec-{}", self.next_exec.fetch_add(1, Ordering::SeqCst) + 1);
        let (code, output) = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default_exit.lock().unwrap().clone());
        self.exits.lock().unwrap().insert(exec_id.clone(), code);
        self.pending_output.lock().unwrap().insert(exec_id.clone(), output);
        Ok(exec_id)
    }

    async fn attach_exec(&self, exec_id: &str) -> Result<OutputStream, RuntimeError> {
        self.record("attach".to_string());
        self.check("attach")?;
        let delay = *self.exec_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let output = self.pending_output.lock().unwrap().remove(exec_id).unwrap_or_default();
        let chunks: Vec<Result<Vec<u8>, RuntimeError>> = if output.is_empty() {
            Vec::new()
        } else {
            vec![Ok(output.into_bytes())]
        };
        Ok(Box::pin(futures_util::stream::iter(chunks)))
    }

    async fn exec_exit_code(&self, exec_id: &str) -> Result<i64, RuntimeError> {
        self.record("inspect".to_string());
        self.check("inspect")?;
        Ok(self.exits.lock().unwrap().get(exec_id).copied().unwrap_or(0))
    }

    async fn stop_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.record(format!("stop:{}", id));
        self.check("stop")
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        self.record(if force {
            format!("remove:{}:force", id)
        } else {
            format!("remove:{}", id)
        });
        self.check("remove")?;
        if id.starts_with("id-") {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Language model
// ─────────────────────────────────────────────────────────────────────────────

enum Behaviour {
    Script,
    Fail,
    Hang,
}

/// Answers from a script, then repeats the fallback forever
pub struct ScriptedModel {
    responses: Mutex<VecDeque<String>>,
    fallback: String,
    behaviour: Behaviour,
    calls: Mutex<Vec<Vec<ChatMessage>>>,
    dropped_midway: Arc<AtomicBool>,
}

impl ScriptedModel {
    pub fn new(responses: &[&str], fallback: &str) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.iter().map(|s| s.to_string()).collect()),
            fallback: fallback.to_string(),
            behaviour: Behaviour::Script,
            calls: Mutex::new(Vec::new()),
            dropped_midway: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Every call fails with an API error
    pub fn failing() -> Arc<Self> {
        let mut model = Self::blank();
        model.behaviour = Behaviour::Fail;
        Arc::new(model)
    }

    /// Every call waits forever
    pub fn hanging() -> Arc<Self> {
        let mut model = Self::blank();
        model.behaviour = Behaviour::Hang;
        Arc::new(model)
    }

    fn blank() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            fallback: String::new(),
            behaviour: Behaviour::Script,
            calls: Mutex::new(Vec::new()),
            dropped_midway: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn calls(&self) -> Vec<Vec<ChatMessage>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// True once an in-flight call was abandoned by its caller
    pub fn was_dropped_midway(&self) -> bool {
        self.dropped_midway.load(Ordering::SeqCst)
    }
}

/// Sets a flag when the generate future is dropped before finishing
struct DropFlag(Arc<AtomicBool>, bool);

impl Drop for DropFlag {
    fn drop(&mut self) {
        if !self.1 {
            self.0.store(true, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn generate(
        &self,
        _model: &str,
        messages: &[ChatMessage],
        on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<Completion, LlmError> {
        self.calls.lock().unwrap().push(messages.to_vec());
        let mut guard = DropFlag(Arc::clone(&self.dropped_midway), false);

        let content = match self.behaviour {
            Behaviour::Fail => {
                guard.1 = true;
                return Err(LlmError::Api("model unavailable".to_string()));
            }
            Behaviour::Hang => {
                std::future::pending::<()>().await;
                String::new()
            }
            Behaviour::Script => self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone()),
        };

        for piece in content.split_inclusive('\n') {
            on_chunk(piece);
        }
        guard.1 = true;

        Ok(Completion {
            content,
            finish_reason: Some("stop".to_string()),
            completion_tokens: None,
        })
    }

    fn count_tokens(&self, _model: &str, text: &str) -> usize {
        text.split_whitespace().count()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tasks
// ─────────────────────────────────────────────────────────────────────────────

/// A task plus the receiving ends the gateway would hold
pub struct TaskParts {
    pub task: Task,
    pub done: oneshot::Receiver<TaskOutcome>,
    pub lines: mpsc::UnboundedReceiver<String>,
    pub cancel: CancellationToken,
}

pub fn task(id: u64, prompt: &str, max_retry: u32) -> TaskParts {
    let cancel = CancellationToken::new();
    let (completion, done) = CompletionSignal::channel();
    let (logger, lines) = TaskLogger::channel(id);
    TaskParts {
        task: Task {
            id,
            system_prompt: "You write code.".to_string(),
            user_prompt: prompt.to_string(),
            image: "alpine:3".to_string(),
            workdir_hint: String::new(),
            max_retry,
            model: "test-model".to_string(),
            cancel: cancel.clone(),
            completion,
            logger,
        },
        done,
        lines,
        cancel,
    }
}

/// Everything currently buffered in a line receiver
pub fn drain_lines(lines: &mut mpsc::UnboundedReceiver<String>) -> Vec<String> {
    let mut out = Vec::new();
    while let Ok(line) = lines.try_recv() {
        out.push(line);
    }
    out
}

pub const ECHO_HI: &str = "Here you go:\n```sh\necho hi\n```\n";
pub const EXIT_ONE: &str = "```sh\nexit 1\n```";
