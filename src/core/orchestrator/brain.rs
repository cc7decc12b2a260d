use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::types::{StatusTransitionError, ToolCall, ToolCallResult, ToolCallStatus, Turn};
use crate::core::hooks::{AfterToolCall, BeforeToolCall, HookOutcome, HookPayload, HookPipeline};
use crate::core::llm::{ChatMessage, CompletionRequest, LlmProvider, ModelToolCall};
use crate::core::tools::{ToolContext, ToolRegistry};

pub const ITERATION_CAP_MESSAGE: &str = "I apologize, but I've reached the maximum number of \
steps for this task without finishing it. Please try breaking it into smaller requests.";

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("model backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("model backend did not answer within {0:?}")]
    BackendTimeout(Duration),
    #[error("blocked by hook: {0}")]
    BlockedByHook(String),
    #[error("storage failure: {0}")]
    Storage(String),
}

#[derive(Debug)]
pub struct LoopResult {
    pub final_text: String,
    /// Assistant and tool turns produced by the loop, in order. The last one
    /// is the final assistant turn.
    pub turns: Vec<Turn>,
    pub iterations: usize,
    pub capped: bool,
}

/// The tool-chaining loop for one event.
pub struct ToolLoop<'a> {
    pub llm: &'a dyn LlmProvider,
    pub tools: &'a ToolRegistry,
    pub hooks: &'a HookPipeline,
    pub max_iterations: usize,
    pub tool_timeout: Duration,
    pub model_timeout: Duration,
}

impl ToolLoop<'_> {
    pub async fn run(
        &self,
        conversation_id: &str,
        sender_id: &str,
        mut messages: Vec<ChatMessage>,
    ) -> Result<LoopResult, OrchestratorError> {
        let schemas = self.tools.schemas();
        let cap = self.max_iterations.max(1);
        let mut turns = Vec::new();

        for iteration in 1..=cap {
            let request = CompletionRequest {
                messages: messages.clone(),
                tools: schemas.clone(),
            };
            let completion = match tokio::time::timeout(self.model_timeout, self.llm.complete(&request)).await {
                Err(_) => return Err(OrchestratorError::BackendTimeout(self.model_timeout)),
                Ok(Err(e)) => return Err(OrchestratorError::BackendUnavailable(format!("{:#}", e))),
                Ok(Ok(completion)) => completion,
            };

            if completion.is_final() {
                let text = completion.text.unwrap_or_default();
                debug!(conversation = conversation_id, iteration, "Model produced final answer");
                turns.push(Turn::assistant(text.clone()));
                return Ok(LoopResult {
                    final_text: text,
                    turns,
                    iterations: iteration,
                    capped: false,
                });
            }

            let text = completion.text.unwrap_or_default();
            let model_calls: Vec<ModelToolCall> = completion
                .tool_calls
                .into_iter()
                .map(|mut c| {
                    if c.id.is_empty() {
                        c.id = format!("call_{}", uuid::Uuid::new_v4().simple());
                    }
                    c
                })
                .collect();
            info!(
                conversation = conversation_id,
                iteration,
                calls = model_calls.len(),
                "Model requested tool calls"
            );
            messages.push(ChatMessage::assistant(text.clone(), model_calls.clone()));

            let mut calls = Vec::with_capacity(model_calls.len());
            for model_call in model_calls {
                let call = self.run_tool_call(conversation_id, sender_id, model_call).await;
                messages.push(ChatMessage::tool(call.id.clone(), call.result_text()));
                calls.push(call);
            }
            let results: Vec<Turn> = calls.iter().map(Turn::tool_result).collect();
            turns.push(Turn::assistant_with_calls(text, calls));
            turns.extend(results);
        }

        warn!(conversation = conversation_id, cap, "Iteration cap reached");
        turns.push(Turn::assistant(ITERATION_CAP_MESSAGE));
        Ok(LoopResult {
            final_text: ITERATION_CAP_MESSAGE.to_string(),
            turns,
            iterations: cap,
            capped: true,
        })
    }

    async fn run_tool_call(&self, conversation_id: &str, sender_id: &str, model_call: ModelToolCall) -> ToolCall {
        let started = Instant::now();
        let mut call = ToolCall::pending(model_call.id, model_call.name, model_call.arguments);

        let gate = self
            .hooks
            .dispatch_modifying(HookPayload::BeforeToolCall(BeforeToolCall {
                conversation_id: conversation_id.to_string(),
                call_id: call.id.clone(),
                tool_name: call.tool_name.clone(),
                arguments: call.arguments.clone(),
            }))
            .await;

        match gate {
            HookOutcome::Continue(HookPayload::BeforeToolCall(rewritten)) => {
                call.arguments = rewritten.arguments;
            }
            HookOutcome::Continue(_) => {}
            HookOutcome::Block { reason, substitute } => {
                info!(tool = %call.tool_name, call_id = %call.id, "Tool call blocked: {}", reason);
                settle(call.block(reason, substitute));
            }
            HookOutcome::Cancel => {
                settle(call.block("cancelled by hook", None));
            }
        }

        if call.status == ToolCallStatus::Pending {
            settle(call.start());
            let ctx = ToolContext {
                conversation_id: conversation_id.to_string(),
                sender_id: sender_id.to_string(),
                call_id: call.id.clone(),
            };
            match self
                .tools
                .invoke(&call.tool_name, call.arguments.clone(), &ctx, self.tool_timeout)
                .await
            {
                Ok(value) => settle(call.succeed(value)),
                Err(failure) => {
                    debug!(tool = %call.tool_name, kind = %failure.kind, "Tool call failed: {}", failure.message);
                    settle(call.fail(failure));
                }
            }
        }

        let (result, error) = outcome_fields(&call);
        self.hooks.dispatch_void(HookPayload::AfterToolCall(AfterToolCall {
            conversation_id: conversation_id.to_string(),
            call_id: call.id.clone(),
            tool_name: call.tool_name.clone(),
            arguments: call.arguments.clone(),
            status: call.status,
            result,
            error,
            duration_ms: started.elapsed().as_millis() as u64,
        }));
        call
    }
}

fn settle(transition: Result<(), StatusTransitionError>) {
    if let Err(e) = transition {
        warn!(call_id = %e.call_id, "Ignoring illegal tool call transition: {}", e);
    }
}

fn outcome_fields(call: &ToolCall) -> (Option<Value>, Option<String>) {
    match &call.result {
        Some(ToolCallResult::Success { value }) => (Some(value.clone()), None),
        Some(ToolCallResult::Failure { error }) => (None, Some(error.to_string())),
        Some(ToolCallResult::Blocked { reason, substitute }) => (substitute.clone(), Some(reason.clone())),
        None => (None, None),
    }
}
