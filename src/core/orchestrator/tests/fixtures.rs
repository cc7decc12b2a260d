use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::core::hooks::{HookAction, HookHandler, HookPayload, HookPipeline};
use crate::core::llm::embedding::HashEmbedder;
use crate::core::llm::{ChatRole, Completion, CompletionRequest, LlmProvider, ModelToolCall};
use crate::core::memory::{MemoryStore, MemorySystem, test_memory_system};
use crate::core::orchestrator::{Orchestrator, OrchestratorSettings, OutboundMessage, OutboundRouter, Transport};
use crate::core::tools::{Tool, ToolContext, ToolRegistry, ToolRegistryBuilder};

type Script = Box<dyn Fn(&CompletionRequest, usize) -> Result<Completion> + Send + Sync>;

/// Model stand-in driven by a closure over (request, call index).
pub struct ScriptedLlm {
    script: Script,
    delay: Option<Duration>,
    pub calls: AtomicUsize,
    pub requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedLlm {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&CompletionRequest, usize) -> Result<Completion> + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
            delay: None,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Returns the given completions in order, then "done".
    pub fn sequence(completions: Vec<Completion>) -> Self {
        Self::new(move |_, i| Ok(completions.get(i).cloned().unwrap_or_else(|| Completion::text("done"))))
    }

    pub fn replying(text: &'static str) -> Self {
        Self::new(move |_, _| Ok(Completion::text(text)))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn request(&self, i: usize) -> CompletionRequest {
        self.requests.lock().unwrap()[i].clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let i = self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.script)(request, i)
    }
}

pub fn last_user_text(request: &CompletionRequest) -> String {
    request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == ChatRole::User)
        .map(|m| m.content.clone())
        .unwrap_or_default()
}

pub fn tool_call(id: &str, name: &str, arguments: Value) -> ModelToolCall {
    ModelToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments,
    }
}

#[derive(Default)]
pub struct RecordingTransport {
    pub delivered: Mutex<Vec<OutboundMessage>>,
    pub broken: AtomicBool,
}

impl RecordingTransport {
    pub fn texts(&self) -> Vec<String> {
        self.delivered.lock().unwrap().iter().map(|m| m.text.clone()).collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    fn id(&self) -> &str {
        "test"
    }

    async fn deliver(&self, message: &OutboundMessage) -> Result<()> {
        if self.broken.load(Ordering::SeqCst) {
            bail!("transport down");
        }
        self.delivered.lock().unwrap().push(message.clone());
        Ok(())
    }
}

/// Counts invocations and echoes its `text` argument.
pub struct CountingTool {
    pub name: &'static str,
    pub calls: Arc<AtomicUsize>,
}

impl CountingTool {
    pub fn new(name: &'static str) -> (Arc<Self>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (Arc::new(Self { name, calls: calls.clone() }), calls)
    }
}

#[async_trait]
impl Tool for CountingTool {
    fn name(&self) -> &str {
        self.name
    }
    fn description(&self) -> &str {
        "Echo text and count calls"
    }
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"]
        })
    }
    async fn call(&self, args: Value, _ctx: &ToolContext) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "echo": args["text"] }))
    }
}

/// Records every payload it sees and answers with a fixed action.
pub struct RecordingHook {
    pub label: &'static str,
    pub action: HookAction,
    pub seen: Arc<Mutex<Vec<HookPayload>>>,
}

impl RecordingHook {
    pub fn new(label: &'static str, action: HookAction) -> (Arc<Self>, Arc<Mutex<Vec<HookPayload>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        (
            Arc::new(Self {
                label,
                action,
                seen: seen.clone(),
            }),
            seen,
        )
    }
}

#[async_trait]
impl HookHandler for RecordingHook {
    fn name(&self) -> &str {
        self.label
    }
    async fn handle(&self, payload: &HookPayload) -> Result<HookAction> {
        self.seen.lock().unwrap().push(payload.clone());
        Ok(self.action.clone())
    }
}

pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub llm: Arc<ScriptedLlm>,
    pub transport: Arc<RecordingTransport>,
    pub db: Arc<MemorySystem>,
    pub memory: Arc<MemoryStore>,
}

pub fn settings() -> OrchestratorSettings {
    OrchestratorSettings {
        system_prompt: "You are a test assistant.".into(),
        max_iterations: 5,
        tool_timeout: Duration::from_secs(5),
        model_timeout: Duration::from_secs(5),
        delivery_retries: 1,
        ..OrchestratorSettings::default()
    }
}

pub fn harness(
    llm: ScriptedLlm,
    tools: Arc<ToolRegistry>,
    hooks: Arc<HookPipeline>,
    settings: OrchestratorSettings,
) -> Harness {
    let db = test_memory_system();
    let memory = Arc::new(MemoryStore::new(db.clone(), Arc::new(HashEmbedder::new(64))));
    let transport = Arc::new(RecordingTransport::default());
    let mut router = OutboundRouter::new();
    router.add(transport.clone());
    let llm = Arc::new(llm);
    let orchestrator = Arc::new(Orchestrator::new(
        settings,
        llm.clone(),
        tools,
        hooks,
        db.clone(),
        memory.clone(),
        router,
    ));
    Harness {
        orchestrator,
        llm,
        transport,
        db,
        memory,
    }
}

pub fn no_tools() -> Arc<ToolRegistry> {
    ToolRegistryBuilder::new().freeze()
}

/// Polls until `check` holds, for effects of detached void hooks.
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
