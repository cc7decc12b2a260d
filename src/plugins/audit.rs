use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use super::{Plugin, PluginContext, PluginManifest};
use crate::core::hooks::{HookAction, HookHandler, HookName, HookPayload, HookRegistrar};

pub struct AuditPlugin {
    manifest: PluginManifest,
}

impl AuditPlugin {
    pub fn new() -> Self {
        Self {
            manifest: PluginManifest::builtin("audit", "Audit", "Structured log of tool calls and agent runs"),
        }
    }
}

impl Plugin for AuditPlugin {
    fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    fn register_hooks(&self, _ctx: &PluginContext, registrar: &mut HookRegistrar) -> Result<()> {
        let hook = Arc::new(AuditHook);
        registrar.register(HookName::AfterToolCall, hook.clone(), -100);
        registrar.register(HookName::AgentEnd, hook, -100);
        Ok(())
    }
}

pub(crate) struct AuditHook;

#[async_trait]
impl HookHandler for AuditHook {
    fn name(&self) -> &str {
        "audit"
    }

    async fn handle(&self, payload: &HookPayload) -> Result<HookAction> {
        match payload {
            HookPayload::AfterToolCall(call) => info!(
                target: "squidbot::audit",
                conversation = %call.conversation_id,
                tool = %call.tool_name,
                call_id = %call.call_id,
                status = ?call.status,
                duration_ms = call.duration_ms,
                error = call.error.as_deref().unwrap_or(""),
                "tool call"
            ),
            HookPayload::AgentEnd(end) => info!(
                target: "squidbot::audit",
                conversation = %end.conversation_id,
                success = end.success,
                iterations = end.iterations,
                duration_ms = end.duration_ms,
                error = end.error.as_deref().unwrap_or(""),
                "agent run"
            ),
            _ => {}
        }
        Ok(HookAction::Continue)
    }
}
