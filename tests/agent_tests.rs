//! Integration tests for the agent loop
//!
//! These tests drive the agent with a scripted model and an in-memory
//! container runtime. Tests needing a real model server and Docker are
//! marked #[ignore].

mod common;

use std::sync::Arc;

use codexec::agent::{Agent, AgentContext, AgentOutcome, AttemptReport};
use codexec::llm::Role;
use codexec::sandbox::ContainerExecutor;
use common::{drain_lines, task, FakeRuntime, ScriptedModel, ECHO_HI, EXIT_ONE};

fn context(dir: &std::path::Path) -> AgentContext {
    AgentContext {
        container_name: "box-1".to_string(),
        workdir: dir.join("box-1"),
    }
}

fn agent(model: &Arc<ScriptedModel>, runtime: &Arc<FakeRuntime>) -> Agent {
    Agent::new(model.clone(), Arc::new(ContainerExecutor::new(runtime.clone())))
}

/// A response with the termination marker ends the task without extraction or execution
#[tokio::test]
async fn test_termination_marker_skips_execution() {
    let dir = tempfile::tempdir().unwrap();
    let model = ScriptedModel::new(&["All done.\n```sh\necho unused\n```\nTERMINATE"], "");
    let runtime = FakeRuntime::new();
    let parts = task(1, "say hi", 3);
    let ctx = context(dir.path());

    let run = agent(&model, &runtime).run(&parts.task, &ctx).await;

    assert!(matches!(run.outcome, AgentOutcome::Terminated { .. }));
    assert_eq!(run.stats.attempts, 0);
    assert!(runtime.events().is_empty());
    assert!(!ctx.workdir.exists());
}

/// echo hi, then TERMINATE: one full container lifecycle and one script on disk
#[tokio::test]
async fn test_echo_then_terminate() {
    let dir = tempfile::tempdir().unwrap();
    let model = ScriptedModel::new(&[ECHO_HI, "TERMINATE"], "");
    let runtime = FakeRuntime::with_results(&[(0, "hi\n")]);
    let mut parts = task(1, "print hi", 3);
    let ctx = context(dir.path());

    let run = agent(&model, &runtime).run(&parts.task, &ctx).await;

    assert!(matches!(run.outcome, AgentOutcome::Terminated { .. }));
    assert_eq!(run.stats.attempts, 1);
    assert_eq!(
        runtime.events(),
        vec![
            "create:box-1-a1",
            "start:id-box-1-a1",
            "exec:sh codeblock_1.sh",
            "attach",
            "inspect",
            "stop:id-box-1-a1",
            "remove:id-box-1-a1",
        ]
    );
    assert_eq!(
        std::fs::read_to_string(ctx.workdir.join("codeblock_1.sh")).unwrap(),
        "echo hi\n"
    );

    // system, user, assistant, correction; the model saw all four on its second turn
    let messages = run.conversation.messages();
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[2].role, Role::Assistant);
    assert_eq!(messages[3].content, "exit_code - 0, stdout received : hi\n");
    assert_eq!(model.calls()[1].len(), 4);

    let lines = drain_lines(&mut parts.lines);
    assert!(lines.iter().any(|l| l == "[CODER] : Thinking ...\n"));
    assert!(lines.iter().any(|l| l == "```sh\n"));
    assert!(lines.iter().any(|l| l.contains("exit_code - 0")));
}

/// A code path that always fails runs exactly max_retry attempts
#[tokio::test]
async fn test_always_failing_code_exhausts_retries() {
    let dir = tempfile::tempdir().unwrap();
    let model = ScriptedModel::new(&[], EXIT_ONE);
    let runtime = FakeRuntime::new();
    runtime.set_default_result(1, "");
    let parts = task(1, "fail", 3);

    let run = agent(&model, &runtime).run(&parts.task, &context(dir.path())).await;

    match run.outcome {
        AgentOutcome::GaveUp { last: Some(AttemptReport::Executed(result)) } => {
            assert_eq!(result.exit_code, 1)
        }
        other => panic!("expected GaveUp, got {:?}", other),
    }
    assert_eq!(run.stats.attempts, 3);
    assert_eq!(model.call_count(), 3);
    assert_eq!(runtime.count("create:"), 3);
    assert_eq!(runtime.live(), 0);

    // every attempt got its own container
    let names: Vec<String> = runtime.specs().into_iter().map(|s| s.name).collect();
    assert_eq!(names, vec!["box-1-a1", "box-1-a2", "box-1-a3"]);

    // corrections only between attempts
    let corrections: Vec<_> = run
        .conversation
        .messages()
        .iter()
        .skip(2)
        .filter(|m| m.role == Role::User)
        .collect();
    assert_eq!(corrections.len(), 2);
    assert!(corrections[0]
        .content
        .starts_with("The code exited with exit_code 1. Give me another example with modification"));
}

#[tokio::test]
async fn test_zero_max_retry_means_one_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let model = ScriptedModel::new(&[], EXIT_ONE);
    let runtime = FakeRuntime::new();
    let parts = task(1, "once", 0);

    let run = agent(&model, &runtime).run(&parts.task, &context(dir.path())).await;

    assert!(matches!(run.outcome, AgentOutcome::GaveUp { .. }));
    assert_eq!(run.stats.attempts, 1);
}

/// Successful runs still need the model to say TERMINATE
#[tokio::test]
async fn test_success_without_marker_keeps_going() {
    let dir = tempfile::tempdir().unwrap();
    let model = ScriptedModel::new(&[ECHO_HI, ECHO_HI], "");
    let runtime = FakeRuntime::new();
    runtime.set_default_result(0, "hi\n");
    let parts = task(1, "print hi", 2);

    let run = agent(&model, &runtime).run(&parts.task, &context(dir.path())).await;

    assert!(matches!(run.outcome, AgentOutcome::GaveUp { .. }));
    assert_eq!(run.stats.attempts, 2);
}

#[tokio::test]
async fn test_model_error_fails_task() {
    let dir = tempfile::tempdir().unwrap();
    let model = ScriptedModel::failing();
    let runtime = FakeRuntime::new();
    let parts = task(1, "anything", 3);

    let run = agent(&model, &runtime).run(&parts.task, &context(dir.path())).await;

    match run.outcome {
        AgentOutcome::Failed(e) => assert!(e.to_string().contains("model unavailable")),
        other => panic!("expected Failed, got {:?}", other),
    }
    assert!(runtime.events().is_empty());
}

#[tokio::test]
async fn test_cancelled_task_never_calls_model() {
    let dir = tempfile::tempdir().unwrap();
    let model = ScriptedModel::new(&[ECHO_HI], "");
    let runtime = FakeRuntime::new();
    let parts = task(1, "anything", 3);
    parts.cancel.cancel();

    let run = agent(&model, &runtime).run(&parts.task, &context(dir.path())).await;

    assert!(matches!(run.outcome, AgentOutcome::Canceled));
    assert_eq!(model.call_count(), 0);
    assert!(runtime.events().is_empty());
}

/// Cancelling while the model is thinking abandons the call
#[tokio::test]
async fn test_cancel_while_thinking() {
    let dir = tempfile::tempdir().unwrap();
    let model = ScriptedModel::hanging();
    let runtime = FakeRuntime::new();
    let parts = task(1, "anything", 3);

    let cancel = parts.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let run = agent(&model, &runtime).run(&parts.task, &context(dir.path())).await;

    assert!(matches!(run.outcome, AgentOutcome::Canceled));
    assert!(model.was_dropped_midway());
    assert!(runtime.events().is_empty());
}

/// Sandbox failures consume an attempt and are reported back to the model
#[tokio::test]
async fn test_sandbox_failure_consumes_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let model = ScriptedModel::new(&[], ECHO_HI);
    let runtime = FakeRuntime::new();
    runtime.fail_at("exec_create");
    let parts = task(1, "print hi", 2);

    let run = agent(&model, &runtime).run(&parts.task, &context(dir.path())).await;

    assert!(matches!(
        run.outcome,
        AgentOutcome::GaveUp { last: Some(AttemptReport::SandboxFailed(_)) }
    ));
    assert_eq!(run.stats.attempts, 2);
    assert_eq!(runtime.live(), 0);
    let correction = &run.conversation.messages()[3];
    assert!(correction.content.contains("execution environment failed"));
}

/// Code blocks that cannot be saved consume an attempt without touching the runtime
#[tokio::test]
async fn test_extract_failure_consumes_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, "not a directory").unwrap();
    let model = ScriptedModel::new(&[], ECHO_HI);
    let runtime = FakeRuntime::new();
    let parts = task(1, "print hi", 2);
    let ctx = context(&blocker);

    let run = agent(&model, &runtime).run(&parts.task, &ctx).await;

    assert!(matches!(
        run.outcome,
        AgentOutcome::GaveUp { last: Some(AttemptReport::ExtractFailed(_)) }
    ));
    assert_eq!(run.stats.attempts, 2);
    assert!(runtime.events().is_empty());

    // the second turn carries the failure back to the model
    let calls = model.calls();
    assert_eq!(calls.len(), 2);
    let correction = calls[1].last().unwrap();
    assert_eq!(correction.role, Role::User);
    assert!(correction.content.starts_with("Saving your code blocks failed"));
}

/// Tokens of every response are counted
#[tokio::test]
async fn test_tokens_are_accumulated() {
    let dir = tempfile::tempdir().unwrap();
    let model = ScriptedModel::new(&["one two three", "TERMINATE now"], "");
    let runtime = FakeRuntime::new();
    let parts = task(1, "count", 3);

    let run = agent(&model, &runtime).run(&parts.task, &context(dir.path())).await;

    assert!(matches!(run.outcome, AgentOutcome::Terminated { .. }));
    assert_eq!(run.stats.tokens, 5);
    assert_eq!(run.stats.llm_calls, 2);
}

#[tokio::test]
#[ignore = "Requires an OpenAI-compatible model server and Docker"]
async fn test_agent_real_model_and_docker() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(codexec::ChatClient::new("http://localhost:11434/v1"));
    let runtime = Arc::new(codexec::DockerRuntime::connect_local().unwrap());
    let agent = Agent::new(llm, Arc::new(ContainerExecutor::new(runtime)));
    let mut parts = task(1, "Print the numbers 1 to 5 with a shell script.", 3);
    parts.task.model = "llama3.2".to_string();
    parts.task.system_prompt = codexec::agent::DEFAULT_SYSTEM_PROMPT.to_string();

    let run = agent.run(&parts.task, &context(dir.path())).await;
    assert!(!matches!(run.outcome, AgentOutcome::Failed(_)));
}
