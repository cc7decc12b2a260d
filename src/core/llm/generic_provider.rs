use anyhow::{Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::{ChatMessage, ChatRole, Completion, CompletionRequest, LlmProvider, ModelToolCall};
use crate::core::config::LlmConfig;

// ── OpenAI-compatible request/response ──

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAiMessage<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OpenAiTool<'a>>,
}

#[derive(Serialize)]
struct OpenAiMessage<'a> {
    role: ChatRole,
    content: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<OpenAiToolCallOut>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<&'a str>,
}

#[derive(Serialize)]
struct OpenAiTool<'a> {
    r#type: &'static str,
    function: OpenAiFunctionDecl<'a>,
}

#[derive(Serialize)]
struct OpenAiFunctionDecl<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a Value,
}

#[derive(Serialize)]
struct OpenAiToolCallOut {
    id: String,
    r#type: &'static str,
    function: OpenAiFunctionCall,
}

#[derive(Serialize, Deserialize)]
struct OpenAiFunctionCall {
    name: String,
    /// JSON-encoded arguments object.
    arguments: String,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessageOwned,
}

#[derive(Deserialize)]
struct OpenAiMessageOwned {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAiToolCallIn>>,
}

#[derive(Deserialize)]
struct OpenAiToolCallIn {
    id: String,
    function: OpenAiFunctionCall,
}

// ── Generic Provider ──

/// Chat-completions client for any OpenAI-compatible endpoint.
pub struct GenericProvider {
    name: String,
    base_url: String,
    api_key: String,
    model: String,
    client: Client,
}

impl GenericProvider {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            name: "openai".to_string(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            client,
        })
    }

    fn to_wire(messages: &[ChatMessage]) -> Vec<OpenAiMessage<'_>> {
        messages
            .iter()
            .map(|m| OpenAiMessage {
                role: m.role,
                content: &m.content,
                tool_calls: m
                    .tool_calls
                    .iter()
                    .map(|c| OpenAiToolCallOut {
                        id: c.id.clone(),
                        r#type: "function",
                        function: OpenAiFunctionCall {
                            name: c.name.clone(),
                            arguments: c.arguments.to_string(),
                        },
                    })
                    .collect(),
                tool_call_id: m.tool_call_id.as_deref(),
            })
            .collect()
    }
}

/// Arguments the model failed to encode as JSON are passed through as a raw
/// string so registry validation reports them.
fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(Default::default());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[async_trait]
impl LlmProvider for GenericProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let req = OpenAiRequest {
            model: &self.model,
            messages: Self::to_wire(&request.messages),
            tools: request
                .tools
                .iter()
                .map(|t| OpenAiTool {
                    r#type: "function",
                    function: OpenAiFunctionDecl {
                        name: &t.name,
                        description: &t.description,
                        parameters: &t.parameters,
                    },
                })
                .collect(),
        };

        let url = format!("{}/chat/completions", self.base_url);
        debug!("POST {} ({} messages)", url, request.messages.len());
        let res = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&req)
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(anyhow!(
                "{} API Error: {}",
                self.name,
                res.text().await.unwrap_or_default()
            ));
        }

        let parsed: OpenAiResponse = res.json().await?;
        let message = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| anyhow!("{} API Error: response had no choices", self.name))?;

        Ok(Completion {
            text: message.content.filter(|t| !t.is_empty()),
            tool_calls: message
                .tool_calls
                .unwrap_or_default()
                .into_iter()
                .map(|c| ModelToolCall {
                    id: c.id,
                    arguments: parse_arguments(&c.function.arguments),
                    name: c.function.name,
                })
                .collect(),
        })
    }
}
