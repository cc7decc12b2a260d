use async_trait::async_trait;
use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Everything a tool may want to know about who is calling it.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub conversation_id: String,
    pub sender_id: String,
    pub call_id: String,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON schema of the arguments object.
    fn parameters(&self) -> Value;
    async fn call(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<Value>;
}

/// Declaration advertised to the model backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    ValidationError,
    Fault,
    Timeout,
    UnknownTool,
}

impl fmt::Display for ToolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ToolErrorKind::ValidationError => "validation_error",
            ToolErrorKind::Fault => "fault",
            ToolErrorKind::Timeout => "timeout",
            ToolErrorKind::UnknownTool => "unknown_tool",
        };
        f.write_str(s)
    }
}

/// Structured failure descriptor returned instead of a tool value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ToolFailure {
    pub kind: ToolErrorKind,
    pub message: String,
}

impl ToolFailure {
    pub fn new(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn fault(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::Fault, message)
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RegistryError {
    #[error("tool '{0}' is already registered")]
    NameConflict(String),
    #[error("invalid tool name '{0}'")]
    InvalidName(String),
    #[error("tool '{tool}' has an invalid parameter schema: {message}")]
    InvalidSchema { tool: String, message: String },
}

fn valid_tool_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn compile_parameters(tool: &dyn Tool) -> Result<JSONSchema, RegistryError> {
    let schema = tool.parameters();
    JSONSchema::options()
        .compile(&schema)
        .map_err(|e| RegistryError::InvalidSchema {
            tool: tool.name().to_string(),
            message: e.to_string(),
        })
}

/// Mutable during startup only; `freeze` turns it into the shared registry.
#[derive(Default)]
pub struct ToolRegistryBuilder {
    tools: Vec<(Arc<dyn Tool>, JSONSchema)>,
}

impl ToolRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.iter().any(|(t, _)| t.name() == name)
    }

    /// Checks the name and compiles the parameter schema.
    fn admit(&self, tool: &Arc<dyn Tool>) -> Result<JSONSchema, RegistryError> {
        let name = tool.name();
        if !valid_tool_name(name) {
            return Err(RegistryError::InvalidName(name.to_string()));
        }
        if self.contains(name) {
            return Err(RegistryError::NameConflict(name.to_string()));
        }
        compile_parameters(tool.as_ref())
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), RegistryError> {
        let validator = self.admit(&tool)?;
        debug!("Registered tool: {}", tool.name());
        self.tools.push((tool, validator));
        Ok(())
    }

    /// All-or-nothing: on any conflict or bad schema nothing from `tools`
    /// is registered.
    pub fn register_all(&mut self, tools: Vec<Arc<dyn Tool>>) -> Result<(), RegistryError> {
        let mut seen = std::collections::HashSet::new();
        let mut admitted = Vec::with_capacity(tools.len());
        for tool in tools {
            let validator = self.admit(&tool)?;
            if !seen.insert(tool.name().to_string()) {
                return Err(RegistryError::NameConflict(tool.name().to_string()));
            }
            admitted.push((tool, validator));
        }
        for (tool, validator) in admitted {
            debug!("Registered tool: {}", tool.name());
            self.tools.push((tool, validator));
        }
        Ok(())
    }

    pub fn freeze(self) -> Arc<ToolRegistry> {
        let order: Vec<String> = self.tools.iter().map(|(t, _)| t.name().to_string()).collect();
        let tools = self
            .tools
            .into_iter()
            .map(|(tool, validator)| (tool.name().to_string(), RegisteredTool { tool, validator }))
            .collect();
        info!("Tool registry frozen with {} tool(s)", order.len());
        Arc::new(ToolRegistry { tools, order })
    }
}

struct RegisteredTool {
    tool: Arc<dyn Tool>,
    validator: JSONSchema,
}

/// Read-only name → tool mapping shared by every conversation.
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn empty() -> Arc<Self> {
        ToolRegistryBuilder::new().freeze()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> &[String] {
        &self.order
    }

    /// Schemas in registration order.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|entry| ToolSchema {
                name: entry.tool.name().to_string(),
                description: entry.tool.description().to_string(),
                parameters: entry.tool.parameters(),
            })
            .collect()
    }

    /// Validate then run the tool on its own task, bounded by `timeout`.
    /// Errors and panics inside the tool come back as `Fault`.
    pub async fn invoke(
        &self,
        name: &str,
        args: Value,
        ctx: &ToolContext,
        timeout: Duration,
    ) -> Result<Value, ToolFailure> {
        let Some(entry) = self.tools.get(name) else {
            return Err(ToolFailure::new(
                ToolErrorKind::UnknownTool,
                format!("no tool named '{}'", name),
            ));
        };

        if let Err(errors) = entry.validator.validate(&args) {
            let message = errors
                .map(|e| {
                    let path = e.instance_path.to_string();
                    if path.is_empty() {
                        e.to_string()
                    } else {
                        format!("{}: {}", path, e)
                    }
                })
                .collect::<Vec<_>>()
                .join("; ");
            debug!(tool = name, "Rejected arguments: {}", message);
            return Err(ToolFailure::new(ToolErrorKind::ValidationError, message));
        }
        let tool = entry.tool.clone();

        let ctx = ctx.clone();
        let mut handle = tokio::spawn(async move { tool.call(args, &ctx).await });

        match tokio::time::timeout(timeout, &mut handle).await {
            Err(_) => {
                handle.abort();
                warn!(tool = name, timeout_ms = timeout.as_millis() as u64, "Tool timed out");
                Err(ToolFailure::new(
                    ToolErrorKind::Timeout,
                    format!("'{}' did not finish within {}s", name, timeout.as_secs_f32()),
                ))
            }
            Ok(Err(join_err)) => {
                warn!(tool = name, "Tool panicked: {}", join_err);
                Err(ToolFailure::fault(format!("'{}' crashed: {}", name, join_err)))
            }
            Ok(Ok(Err(e))) => Err(ToolFailure::fault(format!("{:#}", e))),
            Ok(Ok(Ok(value))) => Ok(value),
        }
    }
}
