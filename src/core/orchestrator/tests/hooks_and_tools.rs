use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use super::fixtures::*;
use crate::core::hooks::{DEFAULT_PRIORITY, HookAction, HookHandler, HookName, HookPayload, HookPipelineBuilder};
use crate::core::llm::Completion;
use crate::core::orchestrator::types::Event;
use crate::core::orchestrator::{HandleOutcome, ToolCallStatus};
use crate::core::tools::ToolRegistryBuilder;

/// Rewrites payloads of the hooks it is registered on.
struct Rewriter;

#[async_trait]
impl HookHandler for Rewriter {
    fn name(&self) -> &str {
        "rewriter"
    }
    async fn handle(&self, payload: &HookPayload) -> Result<HookAction> {
        Ok(match payload {
            HookPayload::BeforeToolCall(p) => {
                let mut p = p.clone();
                p.arguments = json!({"text": "rewritten"});
                HookAction::Replace(HookPayload::BeforeToolCall(p))
            }
            HookPayload::MessageSending(p) => {
                let mut p = p.clone();
                p.content = format!("{} (edited)", p.content);
                HookAction::Replace(HookPayload::MessageSending(p))
            }
            HookPayload::BeforeAgentStart(p) => {
                let mut p = p.clone();
                p.system_prompt = "You are a pirate.".into();
                p.prepend_context.push("The user prefers short answers.".into());
                HookAction::Replace(HookPayload::BeforeAgentStart(p))
            }
            _ => HookAction::Continue,
        })
    }
}

/// Blocks one tool name, like a policy plugin would.
struct DenyTool(&'static str);

#[async_trait]
impl HookHandler for DenyTool {
    fn name(&self) -> &str {
        "deny"
    }
    async fn handle(&self, payload: &HookPayload) -> Result<HookAction> {
        match payload {
            HookPayload::BeforeToolCall(p) if p.tool_name == self.0 => Ok(HookAction::block("policy violation")),
            _ => Ok(HookAction::Continue),
        }
    }
}

// --- before_tool_call ---

#[tokio::test]
async fn high_priority_block_stops_the_tool_and_later_handlers() {
    let (dangerous, calls) = CountingTool::new("dangerous_tool");
    let mut tools = ToolRegistryBuilder::new();
    tools.register(dangerous).unwrap();

    let (late, late_seen) = RecordingHook::new("late", HookAction::Continue);
    let (after, after_seen) = RecordingHook::new("after", HookAction::Continue);
    let mut hooks = HookPipelineBuilder::new();
    hooks.register(HookName::BeforeToolCall, late, 0);
    hooks.register(HookName::BeforeToolCall, Arc::new(DenyTool("dangerous_tool")), 100);
    hooks.register(HookName::AfterToolCall, after, 0);

    let llm = ScriptedLlm::sequence(vec![
        Completion::tools(vec![tool_call("call_1", "dangerous_tool", json!({"text": "rm -rf"}))]),
        Completion::text("I was not allowed to do that."),
    ]);
    let h = harness(llm, tools.freeze(), hooks.freeze(), settings());

    let outcome = h.orchestrator.handle_event(Event::new("test", "c1", "u", "do it")).await;
    assert!(matches!(outcome, HandleOutcome::Delivered(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(late_seen.lock().unwrap().is_empty());

    let turns = h.db.session_turns("c1").await.unwrap();
    let call = &turns[1].tool_calls[0];
    assert_eq!(call.status, ToolCallStatus::Blocked);
    assert_eq!(call.block_reason(), Some("policy violation"));
    assert!(turns[2].content.contains("policy violation"));

    assert!(eventually(|| !after_seen.lock().unwrap().is_empty()).await);
    let seen = after_seen.lock().unwrap();
    let HookPayload::AfterToolCall(after) = &seen[0] else {
        panic!("wrong payload");
    };
    assert_eq!(after.status, ToolCallStatus::Blocked);
    assert_eq!(after.error.as_deref(), Some("policy violation"));
}

#[tokio::test]
async fn before_tool_call_can_rewrite_arguments() {
    let (echo, calls) = CountingTool::new("echo");
    let mut tools = ToolRegistryBuilder::new();
    tools.register(echo).unwrap();
    let mut hooks = HookPipelineBuilder::new();
    hooks.register(HookName::BeforeToolCall, Arc::new(Rewriter), 0);
    let llm = ScriptedLlm::sequence(vec![
        Completion::tools(vec![tool_call("call_1", "echo", json!({"text": "original"}))]),
        Completion::text("done"),
    ]);
    let h = harness(llm, tools.freeze(), hooks.freeze(), settings());

    h.orchestrator.handle_event(Event::new("test", "c1", "u", "go")).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let tool_msg = h.llm.request(1).messages.last().cloned().unwrap();
    assert!(tool_msg.content.contains("rewritten"), "{}", tool_msg.content);
}

// --- Tool failures ---

#[tokio::test]
async fn invalid_arguments_come_back_as_a_failed_call() {
    let (echo, calls) = CountingTool::new("echo");
    let mut tools = ToolRegistryBuilder::new();
    tools.register(echo).unwrap();
    let llm = ScriptedLlm::sequence(vec![
        Completion::tools(vec![
            tool_call("call_1", "echo", json!({"text": 42})),
            tool_call("call_2", "missing_tool", json!({})),
        ]),
        Completion::text("sorry, both failed"),
    ]);
    let h = harness(llm, tools.freeze(), HookPipelineBuilder::new().freeze(), settings());

    let outcome = h.orchestrator.handle_event(Event::new("test", "c1", "u", "go")).await;
    assert!(matches!(outcome, HandleOutcome::Delivered(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let second = h.llm.request(1);
    let n = second.messages.len();
    assert!(second.messages[n - 2].content.contains("validation_error"));
    assert!(second.messages[n - 1].content.contains("unknown_tool"));

    let turns = h.db.session_turns("c1").await.unwrap();
    assert!(turns[1].tool_calls.iter().all(|c| c.status == ToolCallStatus::Failed));
}

// --- message_sending ---

#[tokio::test]
async fn cancelled_message_is_neither_sent_nor_recorded() {
    let (cancel, _) = RecordingHook::new("mute", HookAction::Cancel);
    let mut hooks = HookPipelineBuilder::new();
    hooks.register(HookName::MessageSending, cancel, 0);
    let h = harness(ScriptedLlm::replying("HEARTBEAT_OK"), no_tools(), hooks.freeze(), settings());

    let outcome = h.orchestrator.handle_event(Event::new("test", "c1", "u", "anything?")).await;
    assert_eq!(outcome, HandleOutcome::NoOp);
    assert!(h.transport.texts().is_empty());
    assert_eq!(h.db.turn_count("c1").await.unwrap(), 0);
}

#[tokio::test]
async fn blocked_message_reports_the_reason_and_is_not_sent() {
    let (gate, _) = RecordingHook::new("filter", HookAction::block("contains secrets"));
    let mut hooks = HookPipelineBuilder::new();
    hooks.register(HookName::MessageSending, gate, DEFAULT_PRIORITY);
    let h = harness(ScriptedLlm::replying("the password is hunter2"), no_tools(), hooks.freeze(), settings());

    let outcome = h.orchestrator.handle_event(Event::new("test", "c1", "u", "tell me")).await;
    assert_eq!(
        outcome,
        HandleOutcome::Blocked {
            reason: "contains secrets".into()
        }
    );
    assert!(h.transport.texts().is_empty());
    assert_eq!(h.db.turn_count("c1").await.unwrap(), 0);
}

#[tokio::test]
async fn rewritten_message_is_what_gets_sent_and_stored() {
    let mut hooks = HookPipelineBuilder::new();
    hooks.register(HookName::MessageSending, Arc::new(Rewriter), 0);
    let h = harness(ScriptedLlm::replying("hi"), no_tools(), hooks.freeze(), settings());

    h.orchestrator.handle_event(Event::new("test", "c1", "u", "hello")).await;
    assert_eq!(h.transport.texts(), vec!["hi (edited)"]);
    let turns = h.db.session_turns("c1").await.unwrap();
    assert_eq!(turns.last().unwrap().content, "hi (edited)");
}

// --- before_agent_start ---

#[tokio::test]
async fn agent_start_can_be_cancelled_or_blocked() {
    for (action, expected) in [
        (HookAction::Cancel, HandleOutcome::NoOp),
        (
            HookAction::block("quiet hours"),
            HandleOutcome::Blocked {
                reason: "quiet hours".into(),
            },
        ),
    ] {
        let (gate, _) = RecordingHook::new("gate", action);
        let mut hooks = HookPipelineBuilder::new();
        hooks.register(HookName::BeforeAgentStart, gate, 0);
        let h = harness(ScriptedLlm::replying("never"), no_tools(), hooks.freeze(), settings());

        let outcome = h.orchestrator.handle_event(Event::new("test", "c1", "u", "hi")).await;
        assert_eq!(outcome, expected);
        assert_eq!(h.llm.call_count(), 0);
        assert!(h.transport.texts().is_empty());
    }
}

#[tokio::test]
async fn agent_start_can_replace_the_system_prompt() {
    let mut hooks = HookPipelineBuilder::new();
    hooks.register(HookName::BeforeAgentStart, Arc::new(Rewriter), 0);
    let h = harness(ScriptedLlm::replying("arr"), no_tools(), hooks.freeze(), settings());

    h.orchestrator.handle_event(Event::new("test", "c1", "u", "hi")).await;
    let system = &h.llm.request(0).messages[0].content;
    assert!(system.starts_with("You are a pirate."));
    assert!(system.contains("The user prefers short answers."));
}

// --- Session hooks ---

#[tokio::test]
async fn session_start_fires_once_and_end_fires_on_request() {
    let (start, starts) = RecordingHook::new("start", HookAction::Continue);
    let (end, ends) = RecordingHook::new("end", HookAction::Continue);
    let mut hooks = HookPipelineBuilder::new();
    hooks.register(HookName::SessionStart, start, 0);
    hooks.register(HookName::SessionEnd, end, 0);
    let h = harness(ScriptedLlm::replying("ok"), no_tools(), hooks.freeze(), settings());

    h.orchestrator.handle_event(Event::new("test", "c1", "u", "one")).await;
    h.orchestrator.handle_event(Event::new("test", "c1", "u", "two")).await;
    h.orchestrator.end_session("c1").await;

    assert!(eventually(|| starts.lock().unwrap().len() == 1).await);
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert_eq!(starts.lock().unwrap().len(), 1);
    assert_eq!(ends.lock().unwrap().len(), 1);
    assert_eq!(ends.lock().unwrap()[0].conversation_id(), "c1");
}
