use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::core::orchestrator::types::{Event, ToolCallStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookName {
    BeforeAgentStart,
    AgentEnd,
    MessageReceived,
    MessageSending,
    MessageSent,
    BeforeToolCall,
    AfterToolCall,
    SessionStart,
    SessionEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchKind {
    /// Fire-and-forget; results are ignored.
    Void,
    /// Sequential by priority; may rewrite, block or cancel.
    Modifying,
}

impl HookName {
    pub const ALL: [HookName; 9] = [
        HookName::BeforeAgentStart,
        HookName::AgentEnd,
        HookName::MessageReceived,
        HookName::MessageSending,
        HookName::MessageSent,
        HookName::BeforeToolCall,
        HookName::AfterToolCall,
        HookName::SessionStart,
        HookName::SessionEnd,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HookName::BeforeAgentStart => "before_agent_start",
            HookName::AgentEnd => "agent_end",
            HookName::MessageReceived => "message_received",
            HookName::MessageSending => "message_sending",
            HookName::MessageSent => "message_sent",
            HookName::BeforeToolCall => "before_tool_call",
            HookName::AfterToolCall => "after_tool_call",
            HookName::SessionStart => "session_start",
            HookName::SessionEnd => "session_end",
        }
    }

    pub fn kind(&self) -> DispatchKind {
        match self {
            HookName::BeforeAgentStart | HookName::MessageSending | HookName::BeforeToolCall => {
                DispatchKind::Modifying
            }
            _ => DispatchKind::Void,
        }
    }
}

impl fmt::Display for HookName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BeforeAgentStart {
    pub conversation_id: String,
    pub prompt: String,
    pub system_prompt: String,
    /// Extra blocks placed ahead of the recalled memories.
    pub prepend_context: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentEnd {
    pub conversation_id: String,
    pub prompt: String,
    pub success: bool,
    pub response: Option<String>,
    pub error: Option<String>,
    pub iterations: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageSending {
    pub conversation_id: String,
    pub content: String,
    pub proactive: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageSent {
    pub conversation_id: String,
    pub content: String,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BeforeToolCall {
    pub conversation_id: String,
    pub call_id: String,
    pub tool_name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AfterToolCall {
    pub conversation_id: String,
    pub call_id: String,
    pub tool_name: String,
    pub arguments: Value,
    pub status: ToolCallStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub conversation_id: String,
}

/// The value threaded through a dispatch. Each variant belongs to exactly
/// one hook name.
#[derive(Debug, Clone, PartialEq)]
pub enum HookPayload {
    BeforeAgentStart(BeforeAgentStart),
    AgentEnd(AgentEnd),
    MessageReceived(Event),
    MessageSending(MessageSending),
    MessageSent(MessageSent),
    BeforeToolCall(BeforeToolCall),
    AfterToolCall(AfterToolCall),
    SessionStart(SessionInfo),
    SessionEnd(SessionInfo),
}

impl HookPayload {
    pub fn hook_name(&self) -> HookName {
        match self {
            HookPayload::BeforeAgentStart(_) => HookName::BeforeAgentStart,
            HookPayload::AgentEnd(_) => HookName::AgentEnd,
            HookPayload::MessageReceived(_) => HookName::MessageReceived,
            HookPayload::MessageSending(_) => HookName::MessageSending,
            HookPayload::MessageSent(_) => HookName::MessageSent,
            HookPayload::BeforeToolCall(_) => HookName::BeforeToolCall,
            HookPayload::AfterToolCall(_) => HookName::AfterToolCall,
            HookPayload::SessionStart(_) => HookName::SessionStart,
            HookPayload::SessionEnd(_) => HookName::SessionEnd,
        }
    }

    pub fn conversation_id(&self) -> &str {
        match self {
            HookPayload::BeforeAgentStart(p) => &p.conversation_id,
            HookPayload::AgentEnd(p) => &p.conversation_id,
            HookPayload::MessageReceived(e) => &e.conversation_id,
            HookPayload::MessageSending(p) => &p.conversation_id,
            HookPayload::MessageSent(p) => &p.conversation_id,
            HookPayload::BeforeToolCall(p) => &p.conversation_id,
            HookPayload::AfterToolCall(p) => &p.conversation_id,
            HookPayload::SessionStart(p) | HookPayload::SessionEnd(p) => &p.conversation_id,
        }
    }
}

/// What a single handler asks for.
#[derive(Debug, Clone, PartialEq)]
pub enum HookAction {
    Continue,
    /// Hand a rewritten payload to the next handler.
    Replace(HookPayload),
    Block {
        reason: String,
        substitute: Option<Value>,
    },
    Cancel,
}

impl HookAction {
    pub fn block(reason: impl Into<String>) -> Self {
        HookAction::Block {
            reason: reason.into(),
            substitute: None,
        }
    }
}

/// Aggregate result of one dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum HookOutcome {
    Continue(HookPayload),
    Block {
        reason: String,
        substitute: Option<Value>,
    },
    Cancel,
}

impl HookOutcome {
    pub fn is_short_circuit(&self) -> bool {
        !matches!(self, HookOutcome::Continue(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modifying_hooks_are_the_three_gates() {
        let modifying: Vec<_> = HookName::ALL
            .iter()
            .filter(|h| h.kind() == DispatchKind::Modifying)
            .map(|h| h.as_str())
            .collect();
        assert_eq!(
            modifying,
            vec!["before_agent_start", "message_sending", "before_tool_call"]
        );
    }

    #[test]
    fn payload_knows_its_hook() {
        let payload = HookPayload::SessionEnd(SessionInfo {
            conversation_id: "c1".into(),
        });
        assert_eq!(payload.hook_name(), HookName::SessionEnd);
        assert_eq!(payload.conversation_id(), "c1");
    }
}
