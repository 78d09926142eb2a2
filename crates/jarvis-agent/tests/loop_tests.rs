// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Reasoning-loop tests against the scripted provider — no network, a real
//! in-process bus, real journals on disk.

use std::sync::{Arc, Mutex, RwLock};

use jarvis_agent::{run_dm_turn, run_task, AgentContext};
use jarvis_bus::Broker;
use jarvis_model::{
    mock::{text_turn, ScriptedProvider},
    ChatChunk, ProviderRegistry, StopReason,
};
use jarvis_plugin::PluginHost;
use jarvis_proto::{
    coordination::TaskResult, subjects, AgentMessage, AgentMessageKind, ContentBlock,
    MessageContent, Role, SessionEntry, Task, TaskPriority, TaskStatus, Usage,
};
use jarvis_session::{read_records, restore_messages};
use jarvis_tools::{builtin::CalculatorTool, ToolRegistry};

struct Fixture {
    ctx: AgentContext,
    _broker: Broker,
    _dir: tempfile::TempDir,
}

async fn fixture(provider: ScriptedProvider, fallbacks: Vec<String>) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let broker = Broker::in_process();

    let mut providers = ProviderRegistry::new();
    providers.register(Arc::new(provider));
    providers.init_index().await;

    let mut tools = ToolRegistry::new();
    tools.register(CalculatorTool);

    let mut config: jarvis_config::AgentConfig =
        serde_yaml::from_str("id: dev-1\nrole: dev\n").unwrap();
    config.model.primary = "mock-model".into();
    config.model.fallbacks = fallbacks;

    let ctx = AgentContext {
        config: Arc::new(config),
        bus: broker.local_client(),
        providers: Arc::new(providers),
        tools: Arc::new(tools),
        plugins: Arc::new(PluginHost::load(&[])),
        sessions_dir: dir.path().to_path_buf(),
        peers: Arc::new(RwLock::new(Vec::new())),
        inbox: Arc::new(Mutex::new(Vec::new())),
    };
    Fixture {
        ctx,
        _broker: broker,
        _dir: dir,
    }
}

fn task(title: &str, description: &str) -> Task {
    let mut t = Task::new(title, description);
    t.priority = TaskPriority::Normal;
    t.status = TaskStatus::InProgress;
    t
}

#[tokio::test]
async fn happy_path_tool_call_completes_task() {
    let provider = ScriptedProvider::tool_then_text(
        "tu_1",
        "calculator",
        r#"{"expr":"2+2"}"#,
        "4",
    );
    let f = fixture(provider, vec![]).await;
    let t = task("sum 2+2", "Use the calculator to compute 2+2.");

    let outcome = run_task(&f.ctx, &t).await;
    assert_eq!(outcome.status, TaskStatus::Completed);
    assert_eq!(outcome.summary.as_deref(), Some("4"));
    assert!(outcome.usage.total_tokens > 0);

    // The journal holds the full exchange: user, assistant tool_use, the
    // tool_result with "4", and the final assistant answer.
    let path = f.ctx.sessions_dir.join(format!("{}.jsonl", outcome.session_id));
    let records = read_records(&path).unwrap();
    let tool_result = records
        .iter()
        .find_map(|r| match &r.entry {
            SessionEntry::ToolResult {
                content, is_error, ..
            } => Some((content.as_text().unwrap_or("").to_string(), *is_error)),
            _ => None,
        })
        .expect("journal must hold a tool_result");
    assert_eq!(tool_result, ("4".to_string(), false));

    let finals: Vec<_> = records
        .iter()
        .filter_map(|r| match &r.entry {
            SessionEntry::Message {
                role: Role::Assistant,
                content: MessageContent::Text(t),
            } => Some(t.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(finals.last().map(String::as_str), Some("4"));
}

#[tokio::test]
async fn tool_use_restores_with_synthetic_result_turn() {
    // Restore mid-flight semantics: the journal written by the loop feeds
    // straight back into the message list an LLM would see after a crash.
    let provider = ScriptedProvider::tool_then_text(
        "tu_9",
        "calculator",
        r#"{"expr":"3*3"}"#,
        "9",
    );
    let f = fixture(provider, vec![]).await;
    let outcome = run_task(&f.ctx, &task("nine", "compute 3*3")).await;
    assert_eq!(outcome.status, TaskStatus::Completed);

    let path = f.ctx.sessions_dir.join(format!("{}.jsonl", outcome.session_id));
    let messages = restore_messages(&read_records(&path).unwrap());

    let tool_use_idx = messages
        .iter()
        .position(|m| !m.tool_uses().is_empty())
        .expect("assistant tool_use message");
    let synthetic = &messages[tool_use_idx + 1];
    assert_eq!(synthetic.role, Role::User);
    match &synthetic.content {
        MessageContent::Blocks(blocks) => match &blocks[0] {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                assert_eq!(tool_use_id, "tu_9");
                assert_eq!(content.as_text(), Some("9"));
                assert!(!is_error);
            }
            other => panic!("expected tool_result, got {other:?}"),
        },
        other => panic!("expected blocks, got {other:?}"),
    }
}

#[tokio::test]
async fn tool_error_feeds_back_without_aborting() {
    // Round 1 calls the calculator with a malformed expression; round 2 the
    // model recovers and answers in text.
    let provider = ScriptedProvider::tool_then_text(
        "tu_1",
        "calculator",
        r#"{"expr":"2+"}"#,
        "that expression was malformed",
    );
    let f = fixture(provider, vec![]).await;
    let outcome = run_task(&f.ctx, &task("bad expr", "compute 2+")).await;

    assert_eq!(outcome.status, TaskStatus::Completed, "loop must survive");
    let path = f.ctx.sessions_dir.join(format!("{}.jsonl", outcome.session_id));
    let records = read_records(&path).unwrap();
    let is_error = records.iter().any(|r| {
        matches!(
            r.entry,
            SessionEntry::ToolResult { is_error: true, .. }
        )
    });
    assert!(is_error, "error tool_result must be journaled");
}

#[tokio::test]
async fn provider_failover_recovers_on_second_model() {
    let provider =
        ScriptedProvider::failing_first("upstream 500", vec![text_turn("recovered answer")]);
    let f = fixture(provider, vec!["mock-model".into()]).await;
    let outcome = run_task(&f.ctx, &task("resilient", "answer anything")).await;
    assert_eq!(outcome.status, TaskStatus::Completed);
    assert_eq!(outcome.summary.as_deref(), Some("recovered answer"));
}

#[tokio::test]
async fn all_models_failing_fails_the_task() {
    let provider = ScriptedProvider::failing_first("boom", vec![]);
    let f = fixture(provider, vec![]).await;
    let outcome = run_task(&f.ctx, &task("doomed", "no provider will answer")).await;
    assert_eq!(outcome.status, TaskStatus::Failed);
    assert!(outcome.error.unwrap().contains("provider_error"));
}

#[tokio::test]
async fn token_budget_overrun_fails_with_budget_exceeded() {
    let provider = ScriptedProvider::tool_then_text(
        "tu_1",
        "calculator",
        r#"{"expr":"1+1"}"#,
        "2",
    );
    let f = fixture(provider, vec![]).await;
    let mut config = (*f.ctx.config).clone();
    config.budget.total_tokens = 1;
    let ctx = AgentContext {
        config: Arc::new(config),
        bus: f.ctx.bus.clone(),
        providers: Arc::clone(&f.ctx.providers),
        tools: Arc::clone(&f.ctx.tools),
        plugins: Arc::clone(&f.ctx.plugins),
        sessions_dir: f.ctx.sessions_dir.clone(),
        peers: Arc::clone(&f.ctx.peers),
        inbox: Arc::clone(&f.ctx.inbox),
    };

    let outcome = run_task(&ctx, &task("expensive", "spend tokens")).await;
    assert_eq!(outcome.status, TaskStatus::Failed);
    assert!(outcome.error.unwrap().contains("budget_exceeded"));
}

#[tokio::test]
async fn max_tokens_stop_preserves_session_and_fails_cleanly() {
    let provider = ScriptedProvider::new(vec![vec![
        ChatChunk::TextDelta("truncated answ".into()),
        ChatChunk::MessageEnd {
            stop_reason: StopReason::MaxTokens,
            usage: Usage {
                input_tokens: 10,
                output_tokens: 4096,
                cache_tokens: 0,
                total_tokens: 4106,
            },
        },
    ]]);
    let f = fixture(provider, vec![]).await;
    let outcome = run_task(&f.ctx, &task("long", "write everything")).await;
    assert_eq!(outcome.status, TaskStatus::Failed);
    assert_eq!(outcome.error.as_deref(), Some("max_tokens"));

    // Session preserved: the partial assistant text is journaled.
    let path = f.ctx.sessions_dir.join(format!("{}.jsonl", outcome.session_id));
    let records = read_records(&path).unwrap();
    assert!(records.iter().any(|r| matches!(
        &r.entry,
        SessionEntry::Message { role: Role::Assistant, content: MessageContent::Text(t) }
            if t == "truncated answ"
    )));
}

#[tokio::test]
async fn task_result_event_is_published_on_the_bus() {
    let provider = ScriptedProvider::always_text("done");
    let f = fixture(provider, vec![]).await;
    let observer = f._broker.local_client();
    let mut sub = observer
        .subscribe(&subjects::agent_result("dev-1"))
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let t = task("notify", "say done");
    let outcome = run_task(&f.ctx, &t).await;
    assert_eq!(outcome.status, TaskStatus::Completed);

    let msg = tokio::time::timeout(std::time::Duration::from_secs(2), sub.recv())
        .await
        .unwrap()
        .unwrap();
    let result: TaskResult = msg.json().unwrap();
    assert_eq!(result.task_id, t.id);
    assert_eq!(result.agent_id, "dev-1");
    assert_eq!(result.status, TaskStatus::Completed);
}

#[tokio::test]
async fn heartbeat_poll_short_circuits_on_literal() {
    let provider = ScriptedProvider::always_text("HEARTBEAT_OK");
    let f = fixture(provider, vec![]).await;
    let dm = AgentMessage {
        id: "m1".into(),
        from: "orchestrator-1".into(),
        to: "dev-1".into(),
        kind: AgentMessageKind::HeartbeatPoll,
        content: "anything new?".into(),
        priority: TaskPriority::Low,
    };
    assert!(run_dm_turn(&f.ctx, &dm).await.is_none());
}

#[tokio::test]
async fn substantive_dm_gets_a_reply() {
    let provider = ScriptedProvider::always_text("build is green");
    let f = fixture(provider, vec![]).await;
    let dm = AgentMessage {
        id: "m2".into(),
        from: "orchestrator-1".into(),
        to: "dev-1".into(),
        kind: AgentMessageKind::Query,
        content: "what is the build status?".into(),
        priority: TaskPriority::Normal,
    };
    let reply = run_dm_turn(&f.ctx, &dm).await.expect("reply expected");
    assert_eq!(reply.to, "orchestrator-1");
    assert_eq!(reply.kind, AgentMessageKind::Result);
    assert_eq!(reply.content, "build is green");
}
