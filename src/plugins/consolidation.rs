use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use serde_json::json;
use std::sync::{Arc, LazyLock};
use tracing::info;

use super::{Plugin, PluginContext, PluginManifest};
use crate::core::hooks::{DEFAULT_PRIORITY, HookAction, HookHandler, HookName, HookPayload, HookRegistrar};
use crate::core::memory::MemoryStore;

static REMEMBER: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?is)^\s*(?:please\s+)?remember(?:\s+that)?[\s,:]+(.+?)\s*[.!]?\s*$").ok()
});

/// Extracts the fact from a "remember ..." request.
pub fn remembered_fact(prompt: &str) -> Option<String> {
    REMEMBER
        .as_ref()?
        .captures(prompt)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Background consolidation: successful runs whose prompt asked to
/// remember something leave a memory behind.
pub struct ConsolidationPlugin {
    manifest: PluginManifest,
}

impl ConsolidationPlugin {
    pub fn new() -> Self {
        Self {
            manifest: PluginManifest::builtin(
                "consolidation",
                "Consolidation",
                "Stores 'remember ...' requests as long-term memories",
            ),
        }
    }
}

impl Plugin for ConsolidationPlugin {
    fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    fn register_hooks(&self, ctx: &PluginContext, registrar: &mut HookRegistrar) -> Result<()> {
        if !ctx.config.plugins.consolidate {
            return Ok(());
        }
        registrar.register(
            HookName::AgentEnd,
            Arc::new(Consolidator {
                memory: ctx.memory.clone(),
            }),
            DEFAULT_PRIORITY,
        );
        Ok(())
    }
}

struct Consolidator {
    memory: Arc<MemoryStore>,
}

#[async_trait]
impl HookHandler for Consolidator {
    fn name(&self) -> &str {
        "consolidation"
    }

    async fn handle(&self, payload: &HookPayload) -> Result<HookAction> {
        if let HookPayload::AgentEnd(end) = payload
            && end.success
            && let Some(fact) = remembered_fact(&end.prompt)
        {
            let id = self
                .memory
                .store(
                    &fact,
                    json!({ "category": "consolidated", "conversation_id": end.conversation_id }),
                )
                .await?;
            info!(conversation = %end.conversation_id, memory_id = %id, "Consolidated memory");
        }
        Ok(HookAction::Continue)
    }
}
