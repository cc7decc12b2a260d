use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::{Plugin, PluginContext, PluginManifest};
use crate::core::hooks::{DEFAULT_PRIORITY, HookAction, HookHandler, HookName, HookPayload, HookRegistrar};
use crate::core::scheduler::heartbeat::HEARTBEAT_OK;

/// Swallows proactive replies that only say `HEARTBEAT_OK`.
pub struct HeartbeatPlugin {
    manifest: PluginManifest,
}

impl HeartbeatPlugin {
    pub fn new() -> Self {
        Self {
            manifest: PluginManifest::builtin("heartbeat", "Heartbeat", "Filters empty heartbeat replies"),
        }
    }
}

impl Plugin for HeartbeatPlugin {
    fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    fn register_hooks(&self, _ctx: &PluginContext, registrar: &mut HookRegistrar) -> Result<()> {
        registrar.register(HookName::MessageSending, Arc::new(HeartbeatFilter), DEFAULT_PRIORITY);
        Ok(())
    }
}

struct HeartbeatFilter;

#[async_trait]
impl HookHandler for HeartbeatFilter {
    fn name(&self) -> &str {
        "heartbeat.filter"
    }

    async fn handle(&self, payload: &HookPayload) -> Result<HookAction> {
        match payload {
            HookPayload::MessageSending(msg) if msg.proactive && msg.content.contains(HEARTBEAT_OK) => {
                debug!(conversation = %msg.conversation_id, "Nothing to report, suppressing heartbeat reply");
                Ok(HookAction::Cancel)
            }
            _ => Ok(HookAction::Continue),
        }
    }
}
