// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! End-to-end agent-loop tests driven by the scripted driver: full turns
//! with tool dispatch, error containment, cancellation, and the tool-call /
//! tool-result pairing invariant.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use tern_config::{ModelConfig, ThinkingLevel};
use tern_core::{
    Agent, AgentEvent, AgentInit, AgentTool, SessionEntry, StreamFn,
};
use tern_model::{
    stream, text_script, tool_script, AssistantMessageEvent, ContentBlock, Message,
    ScriptedDriver, StopReason, StreamError, SystemPart, ToolResultBlock,
};

fn scripted_stream_fn(driver: Arc<ScriptedDriver>) -> StreamFn {
    Arc::new(move |model, context, options| stream(driver.clone(), &model, context, options))
}

fn agent_with(driver: Arc<ScriptedDriver>, tools: Vec<Arc<dyn AgentTool>>) -> Agent {
    Agent::new(AgentInit {
        model: ModelConfig {
            provider: "mock".into(),
            name: "mock-model".into(),
            ..ModelConfig::default()
        },
        system_parts: vec![SystemPart {
            name: "base".into(),
            text: "You are a coding agent.".into(),
        }],
        tools,
        thinking_level: ThinkingLevel::Off,
        session_name: Some("test".into()),
        cwd: "/work".into(),
        stream_fn: Some(scripted_stream_fn(driver)),
        attachment_transformer: None,
    })
    .unwrap()
}

fn record_events(agent: &mut Agent) -> Arc<Mutex<Vec<AgentEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    agent.on(move |e| sink.lock().unwrap().push(e.clone()));
    events
}

struct Calculator;

#[async_trait]
impl AgentTool for Calculator {
    fn name(&self) -> &str {
        "calc"
    }
    fn description(&self) -> &str {
        "adds two numbers"
    }
    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {"a": {"type": "number"}, "b": {"type": "number"}}})
    }
    async fn execute(
        &self,
        _tool_call_id: &str,
        arguments: Value,
        _cancel: CancellationToken,
        on_update: tern_core::ToolUpdateFn,
    ) -> anyhow::Result<Vec<ToolResultBlock>> {
        on_update(vec![ToolResultBlock::text("computing...")]);
        let a = arguments["a"].as_i64().unwrap_or(0);
        let b = arguments["b"].as_i64().unwrap_or(0);
        Ok(vec![ToolResultBlock::text((a + b).to_string())])
    }
}

struct FailingTool;

#[async_trait]
impl AgentTool for FailingTool {
    fn name(&self) -> &str {
        "explode"
    }
    fn parameters(&self) -> Value {
        json!({"type": "object"})
    }
    async fn execute(
        &self,
        _tool_call_id: &str,
        _arguments: Value,
        _cancel: CancellationToken,
        _on_update: tern_core::ToolUpdateFn,
    ) -> anyhow::Result<Vec<ToolResultBlock>> {
        anyhow::bail!("disk on fire")
    }
}

#[tokio::test]
async fn simple_turn_streams_and_appends_assistant() {
    let driver = Arc::new(ScriptedDriver::text_reply("hello there"));
    let mut agent = agent_with(driver, vec![]);
    let events = record_events(&mut agent);

    agent.prompt("hi", None).await.unwrap();

    let events = events.lock().unwrap();
    assert!(matches!(events[1], AgentEvent::TurnStart));
    assert!(events
        .iter()
        .any(|e| matches!(e, AgentEvent::MessageUpdate { event: AssistantMessageEvent::TextDelta { .. } })));
    assert!(events.iter().any(|e| matches!(e, AgentEvent::TurnEnd { .. })));
    assert!(matches!(events.last(), Some(AgentEvent::StateUpdate { is_streaming: false, .. })));

    let messages = agent.session().build_session_context();
    assert_eq!(messages.len(), 2);
    match &messages[1] {
        Message::Assistant(a) => {
            assert_eq!(a.text(), "hello there");
            assert_eq!(a.stop_reason, StopReason::Stop);
        }
        other => panic!("expected assistant, got {other:?}"),
    }
    assert!(!agent.is_streaming());
}

#[tokio::test]
async fn tool_turn_dispatches_and_pairs_results() {
    let driver = Arc::new(ScriptedDriver::tool_then_text(
        "t1",
        "calc",
        vec!["{\"a\":1", ",\"b\":2}"],
        "the answer is 3",
    ));
    let mut agent = agent_with(driver, vec![Arc::new(Calculator)]);
    let events = record_events(&mut agent);

    agent.prompt("add 1 and 2", None).await.unwrap();

    let messages = agent.session().build_session_context();
    // user, assistant(toolUse), toolResult, assistant(stop)
    assert_eq!(messages.len(), 4);
    let (call_id, args) = match &messages[1] {
        Message::Assistant(a) => match &a.content[0] {
            ContentBlock::ToolCall { id, arguments, .. } => (id.clone(), arguments.clone()),
            other => panic!("expected tool call, got {other:?}"),
        },
        other => panic!("expected assistant, got {other:?}"),
    };
    assert_eq!(args, json!({"a": 1, "b": 2}));
    match &messages[2] {
        Message::ToolResult(r) => {
            assert_eq!(r.tool_call_id, call_id);
            assert!(!r.is_error);
            assert_eq!(r.content, vec![ToolResultBlock::text("3")]);
        }
        other => panic!("expected tool result, got {other:?}"),
    }
    match &messages[3] {
        Message::Assistant(a) => assert_eq!(a.text(), "the answer is 3"),
        other => panic!("expected assistant, got {other:?}"),
    }

    // Partial tool output reached observers but never the session.
    let events = events.lock().unwrap();
    assert!(events.iter().any(|e| matches!(
        e,
        AgentEvent::ToolResultPartial { tool_name, .. } if tool_name == "calc"
    )));
}

/// Pairing invariant: every tool-call id of a non-errored assistant message
/// is answered by exactly one tool result before the next assistant message.
#[tokio::test]
async fn tool_call_ids_paired_exactly_once() {
    let driver = Arc::new(ScriptedDriver::tool_then_text(
        "t9",
        "calc",
        vec!["{\"a\":5,\"b\":7}"],
        "done",
    ));
    let mut agent = agent_with(driver, vec![Arc::new(Calculator)]);
    agent.prompt("add", None).await.unwrap();

    let messages = agent.session().build_session_context();
    let mut open: Vec<String> = Vec::new();
    for message in &messages {
        match message {
            Message::Assistant(a) => {
                assert!(
                    open.is_empty(),
                    "unanswered tool calls before next assistant: {open:?}"
                );
                if !matches!(a.stop_reason, StopReason::Error | StopReason::Aborted) {
                    open = a.tool_call_ids().iter().map(|s| s.to_string()).collect();
                }
            }
            Message::ToolResult(r) => {
                let pos = open
                    .iter()
                    .position(|id| id == &r.tool_call_id)
                    .expect("tool result without open call");
                open.remove(pos);
            }
            _ => {}
        }
    }
    assert!(open.is_empty());
}

#[tokio::test]
async fn failing_tool_becomes_error_result_and_turn_continues() {
    let driver = Arc::new(ScriptedDriver::tool_then_text(
        "t1",
        "explode",
        vec!["{}"],
        "recovered",
    ));
    let mut agent = agent_with(driver, vec![Arc::new(FailingTool)]);
    agent.prompt("go", None).await.unwrap();

    let messages = agent.session().build_session_context();
    match &messages[2] {
        Message::ToolResult(r) => {
            assert!(r.is_error);
            assert!(matches!(&r.content[0], ToolResultBlock::Text { text } if text.contains("disk on fire")));
        }
        other => panic!("expected tool result, got {other:?}"),
    }
    // The model saw the error and still finished the turn.
    match messages.last().unwrap() {
        Message::Assistant(a) => assert_eq!(a.text(), "recovered"),
        other => panic!("expected assistant, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_tool_reports_error_result() {
    let driver = Arc::new(ScriptedDriver::tool_then_text(
        "t1",
        "no_such_tool",
        vec!["{}"],
        "oh well",
    ));
    let mut agent = agent_with(driver, vec![Arc::new(Calculator)]);
    agent.prompt("go", None).await.unwrap();

    let messages = agent.session().build_session_context();
    match &messages[2] {
        Message::ToolResult(r) => {
            assert!(r.is_error);
            assert!(matches!(&r.content[0], ToolResultBlock::Text { text } if text.contains("unknown tool")));
        }
        other => panic!("expected tool result, got {other:?}"),
    }
}

#[tokio::test]
async fn queued_messages_drain_as_separate_turns() {
    let driver = Arc::new(ScriptedDriver::new(vec![
        text_script("first reply", ""),
        text_script("second reply", ""),
    ]));
    let mut agent = agent_with(driver, vec![]);
    let events = record_events(&mut agent);

    agent.queue_message(Message::user("queued", 500));
    agent.prompt("typed", None).await.unwrap();

    let events = events.lock().unwrap();
    let turn_starts = events
        .iter()
        .filter(|e| matches!(e, AgentEvent::TurnStart))
        .count();
    let agent_ends = events
        .iter()
        .filter(|e| matches!(e, AgentEvent::AgentEnd))
        .count();
    assert_eq!(turn_starts, 2);
    assert_eq!(agent_ends, 1);

    let messages = agent.session().build_session_context();
    assert_eq!(messages.len(), 4);
}

/// Spec scenario: abort mid-stream, then a later prompt proceeds normally.
#[tokio::test]
async fn abort_mid_stream_then_resume() {
    // First request: emit a delta, then fire the cancel signal the way an
    // external abort would, and resolve the stream as the adapter does.
    // Second request: a normal scripted reply.
    let scripted = Arc::new(ScriptedDriver::text_reply("short answer"));
    let calls = Arc::new(Mutex::new(0usize));
    let stream_fn: StreamFn = {
        let scripted = scripted.clone();
        let calls = calls.clone();
        Arc::new(move |model, context, options| {
            let call_index = {
                let mut guard = calls.lock().unwrap();
                *guard += 1;
                *guard
            };
            if call_index == 1 {
                let (mut sink, out) = tern_model::EventStream::channel();
                let cancel = options.cancel.clone();
                tokio::spawn(async move {
                    let mut partial = tern_model::AssistantMessage::empty(
                        "mock", "mock", "mock-model", 0,
                    );
                    sink.push(AssistantMessageEvent::Start {
                        message: partial.clone(),
                    });
                    partial.content.push(ContentBlock::text("Once upon"));
                    sink.push(AssistantMessageEvent::TextDelta {
                        index: 0,
                        delta: "Once upon".into(),
                        message: partial.clone(),
                    });
                    cancel.cancel();
                    partial.stop_reason = StopReason::Aborted;
                    partial.error_message = Some("aborted: cancel signal fired".into());
                    sink.push(AssistantMessageEvent::Error {
                        reason: StopReason::Aborted,
                        message: partial.clone(),
                    });
                    sink.end(Err(StreamError::Aborted("cancel signal fired".into())));
                });
                out
            } else {
                stream(scripted.clone(), &model, context, options)
            }
        })
    };

    let mut agent = Agent::new(AgentInit {
        model: ModelConfig {
            provider: "mock".into(),
            name: "mock-model".into(),
            ..ModelConfig::default()
        },
        system_parts: vec![],
        tools: vec![],
        thinking_level: ThinkingLevel::Off,
        session_name: None,
        cwd: "/work".into(),
        stream_fn: Some(stream_fn),
        attachment_transformer: None,
    })
    .unwrap();

    agent.prompt("long story", None).await.unwrap();

    let messages = agent.session().build_session_context();
    match &messages[1] {
        Message::Assistant(a) => {
            assert_eq!(a.stop_reason, StopReason::Aborted);
            assert!(!a.content.is_empty());
            assert!(a.error_message.is_some());
        }
        other => panic!("expected aborted assistant, got {other:?}"),
    }
    assert!(agent.last_error().is_some());
    assert!(!agent.is_streaming());

    // A later prompt starts a fresh stream and completes normally.
    agent.prompt("short", None).await.unwrap();
    let messages = agent.session().build_session_context();
    match messages.last().unwrap() {
        Message::Assistant(a) => {
            assert_eq!(a.stop_reason, StopReason::Stop);
            assert_eq!(a.text(), "short answer");
        }
        other => panic!("expected assistant, got {other:?}"),
    }
}

#[tokio::test]
async fn session_records_custom_entries_for_tool_scripts() {
    // A reload between turns lands a skills_reload entry in the persisted
    // stream, and the conversation still round-trips through from_entries.
    let driver = Arc::new(ScriptedDriver::text_reply("ok"));
    let mut agent = agent_with(driver, vec![]);
    agent.reload_skills(
        vec![tern_core::Skill {
            name: "review".into(),
            description: "review a diff".into(),
            file_path: "/s/review.md".into(),
        }],
        "startup",
    );
    agent.prompt("hello", None).await.unwrap();

    let entries = agent.session().entries();
    assert!(entries.iter().any(|e| matches!(
        e,
        SessionEntry::CustomMessage { custom_type, .. } if custom_type == "skills_reload"
    )));
    let restored = tern_core::SessionTree::from_entries(entries).unwrap();
    restored.validate().unwrap();
    // The custom entry is not materialized into provider context.
    assert_eq!(restored.build_session_context().len(), 2);
}

#[tokio::test]
async fn scripted_driver_saw_repaired_transcript() {
    // After an aborted turn, the next request's wire body must not contain
    // the aborted assistant message.
    let scripted = Arc::new(ScriptedDriver::new(vec![text_script("fresh reply", "")]));
    let last = scripted.last_params.clone();

    let mut agent = agent_with(scripted, vec![]);
    // Seed history with an aborted assistant turn and its orphan result.
    agent.replace_messages(vec![
        Message::user("do", 1),
        Message::Assistant(tern_model::AssistantMessage {
            content: vec![ContentBlock::tool_call("T1", "calc", json!({}))],
            stop_reason: StopReason::Aborted,
            ..tern_model::AssistantMessage::empty("mock", "mock", "mock-model", 2)
        }),
        Message::tool_result("T1", "calc", vec![ToolResultBlock::text("x")], false, 3),
    ]);

    agent.prompt("next", None).await.unwrap();

    let params = last.lock().unwrap().clone().unwrap();
    let wire = serde_json::to_string(&params).unwrap();
    assert!(!wire.contains("tool_use"), "aborted call leaked: {wire}");
    assert!(!wire.contains("tool_result"), "orphan result leaked: {wire}");
}

#[tokio::test]
async fn tool_script_helper_produces_tool_use_turn() {
    // Guard for the test fixtures themselves.
    let script = tool_script("id", "name", &["{}"]);
    assert!(script
        .iter()
        .any(|v| v["delta"]["stop_reason"] == json!("tool_use")));
}
