use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

use super::{Plugin, PluginContext, PluginManifest};
use crate::core::hooks::{HookAction, HookHandler, HookName, HookPayload, HookRegistrar};

pub const POLICY_VIOLATION: &str = "policy violation";
pub const SAFETY_PRIORITY: i32 = 100;

/// Refuses tool calls named in `plugins.blocked_tools`.
pub struct SafetyPlugin {
    manifest: PluginManifest,
}

impl SafetyPlugin {
    pub fn new() -> Self {
        Self {
            manifest: PluginManifest::builtin("safety", "Safety", "Blocks tools denied by policy"),
        }
    }
}

impl Plugin for SafetyPlugin {
    fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    fn register_hooks(&self, ctx: &PluginContext, registrar: &mut HookRegistrar) -> Result<()> {
        let guard = ToolGuard::new(ctx.config.plugins.blocked_tools.iter().cloned());
        registrar.register(HookName::BeforeToolCall, Arc::new(guard), SAFETY_PRIORITY);
        Ok(())
    }
}

pub struct ToolGuard {
    blocked: HashSet<String>,
}

impl ToolGuard {
    pub fn new(blocked: impl IntoIterator<Item = String>) -> Self {
        Self {
            blocked: blocked.into_iter().collect(),
        }
    }
}

#[async_trait]
impl HookHandler for ToolGuard {
    fn name(&self) -> &str {
        "safety.tool_guard"
    }

    async fn handle(&self, payload: &HookPayload) -> Result<HookAction> {
        match payload {
            HookPayload::BeforeToolCall(call) if self.blocked.contains(&call.tool_name) => {
                tracing::warn!(tool = %call.tool_name, conversation = %call.conversation_id, "Denied by policy");
                Ok(HookAction::block(POLICY_VIOLATION))
            }
            _ => Ok(HookAction::Continue),
        }
    }
}
