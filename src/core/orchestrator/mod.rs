mod brain;
pub mod delivery;
mod lanes;
pub mod types;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::core::config::AppConfig;
use crate::core::hooks::{
    AgentEnd, BeforeAgentStart, HookOutcome, HookPayload, HookPipeline, MessageSending,
    MessageSent, SessionInfo,
};
use crate::core::llm::{ChatMessage, LlmProvider, ModelToolCall};
use crate::core::memory::{MemoryStore, MemorySystem, ScoredMemory};
use crate::core::scheduler::EventSink;
use crate::core::tools::ToolRegistry;

pub use brain::{ITERATION_CAP_MESSAGE, LoopResult, OrchestratorError, ToolLoop};
pub use delivery::{OutboundRouter, Transport};
pub use lanes::ConversationLanes;
pub use types::{Event, HandleOutcome, OutboundMessage, Role, ToolCall, ToolCallStatus, Turn};

pub const COULD_NOT_COMPLETE: &str =
    "Sorry, I could not complete that request right now. Please try again in a moment.";

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub system_prompt: String,
    pub skills: Vec<String>,
    pub max_iterations: usize,
    pub history_turns: usize,
    pub memory_top_k: usize,
    pub tool_timeout: Duration,
    pub model_timeout: Duration,
    pub delivery_retries: usize,
}

impl OrchestratorSettings {
    pub async fn from_config(config: &AppConfig) -> Self {
        Self {
            system_prompt: config.agent.system_prompt.clone(),
            skills: config.load_skills().await,
            max_iterations: config.agent.max_iterations,
            history_turns: config.agent.history_turns,
            memory_top_k: config.agent.memory_top_k,
            tool_timeout: config.tool_timeout(),
            model_timeout: config.model_timeout(),
            delivery_retries: config.agent.delivery_retries,
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        let config = AppConfig::default();
        Self {
            system_prompt: config.agent.system_prompt.clone(),
            skills: Vec::new(),
            max_iterations: config.agent.max_iterations,
            history_turns: config.agent.history_turns,
            memory_top_k: config.agent.memory_top_k,
            tool_timeout: config.tool_timeout(),
            model_timeout: config.model_timeout(),
            delivery_retries: config.agent.delivery_retries,
        }
    }
}

/// The turn-taking engine. One instance serves every conversation; events
/// for the same conversation are handled one at a time.
pub struct Orchestrator {
    settings: OrchestratorSettings,
    llm: Arc<dyn LlmProvider>,
    tools: Arc<ToolRegistry>,
    hooks: Arc<HookPipeline>,
    sessions: Arc<MemorySystem>,
    memory: Arc<MemoryStore>,
    router: OutboundRouter,
    lanes: ConversationLanes,
}

impl Orchestrator {
    pub fn new(
        settings: OrchestratorSettings,
        llm: Arc<dyn LlmProvider>,
        tools: Arc<ToolRegistry>,
        hooks: Arc<HookPipeline>,
        sessions: Arc<MemorySystem>,
        memory: Arc<MemoryStore>,
        router: OutboundRouter,
    ) -> Self {
        Self {
            settings,
            llm,
            tools,
            hooks,
            sessions,
            memory,
            router,
            lanes: ConversationLanes::new(),
        }
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn hooks(&self) -> &HookPipeline {
        &self.hooks
    }

    /// Run one event through the full pipeline.
    pub async fn handle_event(&self, event: Event) -> HandleOutcome {
        let _lane = self.lanes.acquire(&event.conversation_id).await;
        let started = Instant::now();
        let conversation_id = event.conversation_id.clone();
        info!(
            conversation = %conversation_id,
            source = %event.source,
            event_id = %event.id,
            "Handling event"
        );

        self.hooks.dispatch_void(HookPayload::MessageReceived(event.clone()));

        match self.sessions.turn_count(&conversation_id).await {
            Ok(0) => {
                self.hooks.dispatch_void(HookPayload::SessionStart(SessionInfo {
                    conversation_id: conversation_id.clone(),
                }));
            }
            Ok(_) => {}
            Err(e) => {
                return self
                    .fail(&event, OrchestratorError::Storage(format!("{:#}", e)), true)
                    .await;
            }
        }

        let history = match self
            .sessions
            .recent_turns(&conversation_id, self.settings.history_turns)
            .await
        {
            Ok(turns) => turns,
            Err(e) => {
                return self
                    .fail(&event, OrchestratorError::Storage(format!("{:#}", e)), true)
                    .await;
            }
        };

        let prompt = event.prompt_text();
        let memories = self.recall(&prompt).await;

        let start = BeforeAgentStart {
            conversation_id: conversation_id.clone(),
            prompt: prompt.clone(),
            system_prompt: self.base_system_prompt(),
            prepend_context: Vec::new(),
        };
        let start = match self
            .hooks
            .dispatch_modifying(HookPayload::BeforeAgentStart(start.clone()))
            .await
        {
            HookOutcome::Continue(HookPayload::BeforeAgentStart(rewritten)) => rewritten,
            HookOutcome::Continue(_) => start,
            HookOutcome::Block { reason, .. } => {
                let err = OrchestratorError::BlockedByHook(reason.clone());
                info!(conversation = %conversation_id, hook = "before_agent_start", "{}", err);
                return HandleOutcome::Blocked { reason };
            }
            HookOutcome::Cancel => {
                info!(conversation = %conversation_id, "Agent start cancelled");
                return HandleOutcome::NoOp;
            }
        };

        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(render_system_prompt(
            &start.system_prompt,
            &start.prepend_context,
            &memories,
            event.timestamp,
        )));
        messages.extend(history.iter().map(turn_to_message));
        messages.push(ChatMessage::user(start.prompt.clone()));

        let tool_loop = ToolLoop {
            llm: self.llm.as_ref(),
            tools: self.tools.as_ref(),
            hooks: self.hooks.as_ref(),
            max_iterations: self.settings.max_iterations,
            tool_timeout: self.settings.tool_timeout,
            model_timeout: self.settings.model_timeout,
        };
        let result = match tool_loop.run(&conversation_id, &event.sender_id, messages).await {
            Ok(result) => result,
            Err(e) => {
                warn!(conversation = %conversation_id, "Agent loop aborted: {}", e);
                self.hooks.dispatch_void(HookPayload::AgentEnd(AgentEnd {
                    conversation_id: conversation_id.clone(),
                    prompt: start.prompt.clone(),
                    success: false,
                    response: None,
                    error: Some(e.to_string()),
                    iterations: 0,
                    duration_ms: started.elapsed().as_millis() as u64,
                }));
                return self.fail(&event, e, true).await;
            }
        };

        let proactive = event.is_proactive();
        let sending = MessageSending {
            conversation_id: conversation_id.clone(),
            content: result.final_text.clone(),
            proactive,
        };
        let content = match self
            .hooks
            .dispatch_modifying(HookPayload::MessageSending(sending))
            .await
        {
            HookOutcome::Continue(HookPayload::MessageSending(rewritten)) => rewritten.content,
            HookOutcome::Continue(_) => result.final_text.clone(),
            HookOutcome::Block { reason, .. } => {
                let err = OrchestratorError::BlockedByHook(reason.clone());
                info!(conversation = %conversation_id, hook = "message_sending", "{}", err);
                return HandleOutcome::Blocked { reason };
            }
            HookOutcome::Cancel => {
                info!(conversation = %conversation_id, "Outbound message cancelled");
                return HandleOutcome::NoOp;
            }
        };

        let message = OutboundMessage {
            conversation_id: conversation_id.clone(),
            text: content.clone(),
            in_reply_to: event.id.clone(),
            proactive,
        };
        let delivery = self
            .router
            .deliver(&message, self.settings.delivery_retries)
            .await
            .map_err(|e| format!("{:#}", e));
        if let Err(e) = &delivery {
            error!(conversation = %conversation_id, "Giving up on delivery: {}", e);
        }
        self.hooks.dispatch_void(HookPayload::MessageSent(MessageSent {
            conversation_id: conversation_id.clone(),
            content: content.clone(),
            success: delivery.is_ok(),
            error: delivery.as_ref().err().cloned(),
        }));

        let mut turns = Vec::with_capacity(result.turns.len() + 1);
        turns.push(Turn::user(start.prompt.clone()));
        turns.extend(result.turns);
        if let Some(last) = turns.last_mut() {
            last.content = content.clone();
        }
        if let Err(e) = self.sessions.append_turns(&conversation_id, turns).await {
            return self
                .fail(&event, OrchestratorError::Storage(format!("{:#}", e)), false)
                .await;
        }

        self.hooks.dispatch_void(HookPayload::AgentEnd(AgentEnd {
            conversation_id: conversation_id.clone(),
            prompt: start.prompt,
            success: !result.capped,
            response: Some(content),
            error: result.capped.then(|| "iteration cap reached".to_string()),
            iterations: result.iterations,
            duration_ms: started.elapsed().as_millis() as u64,
        }));
        info!(
            conversation = %conversation_id,
            iterations = result.iterations,
            duration_ms = started.elapsed().as_millis() as u64,
            "Event handled"
        );

        match delivery {
            Ok(()) => HandleOutcome::Delivered(message),
            Err(error) => HandleOutcome::DeliveryFailed { message, error },
        }
    }

    /// Run the event on its own task. The lane keeps per-conversation order.
    pub fn spawn_event(self: &Arc<Self>, event: Event) -> JoinHandle<HandleOutcome> {
        let this = self.clone();
        tokio::spawn(async move { this.handle_event(event).await })
    }

    /// Close a conversation for hook subscribers. The transcript is kept.
    pub async fn end_session(&self, conversation_id: &str) {
        let _lane = self.lanes.acquire(conversation_id).await;
        info!(conversation = conversation_id, "Session ended");
        self.hooks
            .dispatch_void(HookPayload::SessionEnd(SessionInfo {
                conversation_id: conversation_id.to_string(),
            }))
            .join()
            .await;
    }

    pub fn sink(self: &Arc<Self>) -> Arc<dyn EventSink> {
        Arc::new(OrchestratorSink(self.clone()))
    }

    fn base_system_prompt(&self) -> String {
        let mut prompt = self.settings.system_prompt.clone();
        for skill in &self.settings.skills {
            prompt.push_str("\n\n");
            prompt.push_str(skill.trim());
        }
        prompt
    }

    async fn recall(&self, prompt: &str) -> Vec<ScoredMemory> {
        if self.settings.memory_top_k == 0 {
            return Vec::new();
        }
        match self.memory.search(prompt, self.settings.memory_top_k).await {
            Ok(hits) => hits,
            Err(e) => {
                warn!("Memory recall failed, continuing without memories: {:#}", e);
                Vec::new()
            }
        }
    }

    async fn fail(&self, event: &Event, err: OrchestratorError, notify: bool) -> HandleOutcome {
        error!(conversation = %event.conversation_id, "Could not complete event: {}", err);
        if notify {
            let notice = OutboundMessage {
                conversation_id: event.conversation_id.clone(),
                text: COULD_NOT_COMPLETE.to_string(),
                in_reply_to: event.id.clone(),
                proactive: event.is_proactive(),
            };
            if let Err(e) = self.router.deliver(&notice, self.settings.delivery_retries).await {
                warn!(conversation = %event.conversation_id, "Failure notice not delivered: {:#}", e);
            }
        }
        HandleOutcome::Failed {
            message: COULD_NOT_COMPLETE.to_string(),
            error: err.to_string(),
        }
    }
}

struct OrchestratorSink(Arc<Orchestrator>);

#[async_trait]
impl EventSink for OrchestratorSink {
    async fn submit(&self, event: Event) -> anyhow::Result<()> {
        let event_id = event.id.clone();
        let handle = self.0.spawn_event(event);
        tokio::spawn(async move {
            match handle.await {
                Ok(outcome) => info!(event_id = %event_id, "Proactive event finished: {}", outcome_label(&outcome)),
                Err(e) => error!(event_id = %event_id, "Proactive event task failed: {}", e),
            }
        });
        Ok(())
    }
}

fn outcome_label(outcome: &HandleOutcome) -> &'static str {
    match outcome {
        HandleOutcome::Delivered(_) => "delivered",
        HandleOutcome::DeliveryFailed { .. } => "delivery_failed",
        HandleOutcome::NoOp => "noop",
        HandleOutcome::Blocked { .. } => "blocked",
        HandleOutcome::Failed { .. } => "failed",
    }
}

fn turn_to_message(turn: &Turn) -> ChatMessage {
    match turn.role {
        Role::User => ChatMessage::user(turn.content.clone()),
        Role::Assistant => ChatMessage::assistant(
            turn.content.clone(),
            turn.tool_calls
                .iter()
                .map(|c| ModelToolCall {
                    id: c.id.clone(),
                    name: c.tool_name.clone(),
                    arguments: c.arguments.clone(),
                })
                .collect(),
        ),
        Role::Tool => ChatMessage::tool(turn.tool_call_id.clone().unwrap_or_default(), turn.content.clone()),
    }
}

fn render_system_prompt(
    base: &str,
    prepend: &[String],
    memories: &[ScoredMemory],
    now: DateTime<Utc>,
) -> String {
    let mut prompt = base.trim_end().to_string();
    for block in prepend {
        prompt.push_str("\n\n");
        prompt.push_str(block.trim());
    }
    if !memories.is_empty() {
        prompt.push_str("\n\n--- RELEVANT MEMORIES ---\n");
        for hit in memories {
            prompt.push_str(&format!(
                "- {} (saved {})\n",
                hit.record.content,
                hit.record.created_at.format("%Y-%m-%d")
            ));
        }
        prompt.push_str("--- END OF MEMORIES ---");
    }
    prompt.push_str(&format!("\n\nCurrent time: {}", now.format("%Y-%m-%d %H:%M UTC")));
    prompt
}

#[cfg(test)]
pub(crate) mod tests;
