use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::tools::ToolFailure;

pub const SCHEDULER_SOURCE: &str = "scheduler";
pub const HEARTBEAT_SOURCE: &str = "heartbeat";

/// One unit of inbound stimulus. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub source: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(
        source: impl Into<String>,
        conversation_id: impl Into<String>,
        sender_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source: source.into(),
            conversation_id: conversation_id.into(),
            sender_id: sender_id.into(),
            text: text.into(),
            data: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Events not typed by a person: scheduled jobs and heartbeats.
    pub fn is_proactive(&self) -> bool {
        self.source == SCHEDULER_SOURCE || self.source == HEARTBEAT_SOURCE
    }

    /// Text handed to the model as the user turn. Scheduled events carry a
    /// label such as `[Reminder]` in their data.
    pub fn prompt_text(&self) -> String {
        match self
            .data
            .as_ref()
            .and_then(|d| d.get("label"))
            .and_then(Value::as_str)
        {
            Some(label) => format!("{} {}", label, self.text),
            None => self.text.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }
}

/// One role-tagged transcript entry. `seq` is assigned by the session store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub seq: i64,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            seq: 0,
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn assistant_with_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        let mut turn = Self::new(Role::Assistant, content);
        turn.tool_calls = calls;
        turn
    }

    pub fn tool_result(call: &ToolCall) -> Self {
        let mut turn = Self::new(Role::Tool, call.result_text());
        turn.tool_call_id = Some(call.id.clone());
        turn
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallStatus {
    Pending,
    Executing,
    Succeeded,
    Failed,
    Blocked,
}

impl ToolCallStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Blocked)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ToolCallResult {
    Success {
        value: Value,
    },
    Failure {
        error: ToolFailure,
    },
    Blocked {
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        substitute: Option<Value>,
    },
}

#[derive(Debug, thiserror::Error, PartialEq)]
#[error("tool call {call_id}: cannot move from {from:?} to {to:?}")]
pub struct StatusTransitionError {
    pub call_id: String,
    pub from: ToolCallStatus,
    pub to: ToolCallStatus,
}

/// A request from the model to run one tool. Status only moves forward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub tool_name: String,
    pub arguments: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ToolCallResult>,
    pub status: ToolCallStatus,
}

impl ToolCall {
    pub fn pending(id: impl Into<String>, tool_name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            tool_name: tool_name.into(),
            arguments,
            result: None,
            status: ToolCallStatus::Pending,
        }
    }

    fn transition(&mut self, to: ToolCallStatus) -> Result<(), StatusTransitionError> {
        let allowed = matches!(
            (self.status, to),
            (ToolCallStatus::Pending, ToolCallStatus::Executing)
                | (ToolCallStatus::Pending, ToolCallStatus::Blocked)
                | (ToolCallStatus::Pending, ToolCallStatus::Failed)
                | (ToolCallStatus::Executing, ToolCallStatus::Succeeded)
                | (ToolCallStatus::Executing, ToolCallStatus::Failed)
        );
        if !allowed {
            return Err(StatusTransitionError {
                call_id: self.id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), StatusTransitionError> {
        self.transition(ToolCallStatus::Executing)
    }

    pub fn succeed(&mut self, value: Value) -> Result<(), StatusTransitionError> {
        self.transition(ToolCallStatus::Succeeded)?;
        self.result = Some(ToolCallResult::Success { value });
        Ok(())
    }

    pub fn fail(&mut self, error: ToolFailure) -> Result<(), StatusTransitionError> {
        self.transition(ToolCallStatus::Failed)?;
        self.result = Some(ToolCallResult::Failure { error });
        Ok(())
    }

    pub fn block(
        &mut self,
        reason: impl Into<String>,
        substitute: Option<Value>,
    ) -> Result<(), StatusTransitionError> {
        self.transition(ToolCallStatus::Blocked)?;
        self.result = Some(ToolCallResult::Blocked {
            reason: reason.into(),
            substitute,
        });
        Ok(())
    }

    pub fn block_reason(&self) -> Option<&str> {
        match &self.result {
            Some(ToolCallResult::Blocked { reason, .. }) => Some(reason),
            _ => None,
        }
    }

    /// Rendering fed back to the model as the tool turn's content.
    pub fn result_text(&self) -> String {
        match &self.result {
            Some(ToolCallResult::Success { value }) => match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
            Some(ToolCallResult::Failure { error }) => serde_json::json!({
                "error": { "kind": error.kind, "message": error.message }
            })
            .to_string(),
            Some(ToolCallResult::Blocked { reason, substitute }) => serde_json::json!({
                "blocked": true,
                "reason": reason,
                "result": substitute,
            })
            .to_string(),
            None => serde_json::json!({ "status": self.status }).to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub conversation_id: String,
    pub text: String,
    pub in_reply_to: String,
    /// Not a direct reply to something the user just sent.
    pub proactive: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HandleOutcome {
    Delivered(OutboundMessage),
    /// The reply was produced and recorded but every delivery attempt failed.
    DeliveryFailed {
        message: OutboundMessage,
        error: String,
    },
    NoOp,
    Blocked {
        reason: String,
    },
    /// Loop-level failure. `message` is safe to show to the requester.
    Failed {
        message: String,
        error: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tools::{ToolErrorKind, ToolFailure};
    use serde_json::json;

    #[test]
    fn tool_call_happy_path() {
        let mut call = ToolCall::pending("c1", "echo", json!({}));
        call.start().unwrap();
        call.succeed(json!("ok")).unwrap();
        assert_eq!(call.status, ToolCallStatus::Succeeded);
        assert_eq!(call.result_text(), "ok");
    }

    #[test]
    fn terminal_states_never_revert() {
        let mut call = ToolCall::pending("c1", "echo", json!({}));
        call.block("policy violation", None).unwrap();
        assert!(call.start().is_err());
        assert!(call.succeed(json!(1)).is_err());
        assert!(call.fail(ToolFailure::fault("late")).is_err());
        assert_eq!(call.status, ToolCallStatus::Blocked);
        assert_eq!(call.block_reason(), Some("policy violation"));
    }

    #[test]
    fn succeed_requires_executing() {
        let mut call = ToolCall::pending("c1", "echo", json!({}));
        let err = call.succeed(json!(1)).unwrap_err();
        assert_eq!(err.from, ToolCallStatus::Pending);
        assert_eq!(err.to, ToolCallStatus::Succeeded);
        assert!(call.result.is_none());
    }

    #[test]
    fn failure_renders_kind_for_model() {
        let mut call = ToolCall::pending("c1", "echo", json!({}));
        call.fail(ToolFailure::new(ToolErrorKind::ValidationError, "missing 'x'"))
            .unwrap();
        let rendered: Value = serde_json::from_str(&call.result_text()).unwrap();
        assert_eq!(rendered["error"]["kind"], "validation_error");
        assert_eq!(rendered["error"]["message"], "missing 'x'");
    }

    #[test]
    fn scheduled_event_prompt_carries_label() {
        let event = Event::new(SCHEDULER_SOURCE, "c1", "scheduler", "drink water")
            .with_data(json!({ "label": "[Reminder]" }));
        assert!(event.is_proactive());
        assert_eq!(event.prompt_text(), "[Reminder] drink water");
        assert_eq!(event.text, "drink water");
    }
}
