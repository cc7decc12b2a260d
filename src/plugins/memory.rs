use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;

use super::{Plugin, PluginContext, PluginManifest};
use crate::core::memory::MemoryStore;
use crate::core::tools::{Tool, ToolContext};

const DEFAULT_SEARCH_LIMIT: usize = 5;
const DEFAULT_LIST_LIMIT: usize = 20;

/// Long-term memory tools for the model.
pub struct MemoryPlugin {
    manifest: PluginManifest,
}

impl MemoryPlugin {
    pub fn new() -> Self {
        Self {
            manifest: PluginManifest::builtin("memory", "Memory", "Store and recall long-term memories"),
        }
    }
}

impl Plugin for MemoryPlugin {
    fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    fn tools(&self, ctx: &PluginContext) -> Result<Vec<Arc<dyn Tool>>> {
        let store = ctx.memory.clone();
        Ok(vec![
            Arc::new(MemoryAdd(store.clone())),
            Arc::new(MemorySearch(store.clone())),
            Arc::new(MemoryList(store.clone())),
            Arc::new(MemoryDelete(store)),
        ])
    }
}

fn category_prefix(metadata: &Value) -> String {
    match metadata.get("category").and_then(Value::as_str) {
        Some(c) if !c.is_empty() => format!("[{}] ", c),
        _ => String::new(),
    }
}

fn limit_arg(args: &Value, default: usize) -> usize {
    args.get("limit")
        .and_then(Value::as_u64)
        .map(|n| n as usize)
        .unwrap_or(default)
}

struct MemoryAdd(Arc<MemoryStore>);

#[async_trait]
impl Tool for MemoryAdd {
    fn name(&self) -> &str {
        "memory_add"
    }
    fn description(&self) -> &str {
        "Store information in persistent memory with semantic search support. Use this to remember facts, preferences, or important details."
    }
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "content": { "type": "string", "description": "The information to remember" },
                "category": { "type": "string", "description": "Optional category (e.g. 'preference', 'fact', 'task')" }
            },
            "required": ["content"]
        })
    }
    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<Value> {
        let content = args["content"].as_str().unwrap_or_default();
        let mut metadata = json!({ "conversation_id": ctx.conversation_id });
        if let Some(category) = args.get("category").and_then(Value::as_str) {
            metadata["category"] = json!(category);
        }
        let id = self.0.store(content, metadata).await?;
        Ok(json!(format!("Stored in memory (id={}): {}", id, content.trim())))
    }
}

struct MemorySearch(Arc<MemoryStore>);

#[async_trait]
impl Tool for MemorySearch {
    fn name(&self) -> &str {
        "memory_search"
    }
    fn description(&self) -> &str {
        "Search persistent memory using semantic similarity. Finds related memories even if exact words don't match."
    }
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Search query" },
                "limit": { "type": "integer", "minimum": 1, "maximum": 50 }
            },
            "required": ["query"]
        })
    }
    async fn call(&self, args: Value, _ctx: &ToolContext) -> Result<Value> {
        let query = args["query"].as_str().unwrap_or_default();
        let hits = self.0.search(query, limit_arg(&args, DEFAULT_SEARCH_LIMIT)).await?;
        if hits.is_empty() {
            return Ok(json!(format!("No memory entries found for: {}", query)));
        }
        let mut lines = vec![format!("Found {} memories:", hits.len())];
        for hit in hits {
            lines.push(format!(
                "- [{}] {}{} (similarity: {:.2})",
                hit.record.id,
                category_prefix(&hit.record.metadata),
                hit.record.content,
                1.0 - hit.distance
            ));
        }
        Ok(json!(lines.join("\n")))
    }
}

struct MemoryList(Arc<MemoryStore>);

#[async_trait]
impl Tool for MemoryList {
    fn name(&self) -> &str {
        "memory_list"
    }
    fn description(&self) -> &str {
        "List stored memories, newest first."
    }
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "limit": { "type": "integer", "minimum": 1, "description": "Maximum number of memories to return" }
            }
        })
    }
    async fn call(&self, args: Value, _ctx: &ToolContext) -> Result<Value> {
        let records = self.0.list(limit_arg(&args, DEFAULT_LIST_LIMIT)).await?;
        if records.is_empty() {
            return Ok(json!("No memories stored yet."));
        }
        let mut lines = vec![format!("Total memories: {}", records.len())];
        for r in records {
            lines.push(format!("- [{}] {}{}", r.id, category_prefix(&r.metadata), r.content));
        }
        Ok(json!(lines.join("\n")))
    }
}

struct MemoryDelete(Arc<MemoryStore>);

#[async_trait]
impl Tool for MemoryDelete {
    fn name(&self) -> &str {
        "memory_delete"
    }
    fn description(&self) -> &str {
        "Delete a specific memory by its ID."
    }
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "memory_id": { "type": "string", "description": "ID of the memory to delete" }
            },
            "required": ["memory_id"]
        })
    }
    async fn call(&self, args: Value, _ctx: &ToolContext) -> Result<Value> {
        let id = args["memory_id"]
            .as_str()
            .ok_or_else(|| anyhow!("memory_id must be a string"))?;
        if self.0.delete(id).await? {
            Ok(json!(format!("Deleted memory id={}", id)))
        } else {
            Ok(json!(format!("No memory found with id={}", id)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tools::ToolRegistryBuilder;
    use crate::plugins::test_context;
    use std::time::Duration;

    #[tokio::test]
    async fn add_search_list_delete() {
        let ctx = test_context();
        let mut builder = ToolRegistryBuilder::new();
        builder.register_all(MemoryPlugin::new().tools(&ctx).unwrap()).unwrap();
        let tools = builder.freeze();
        let call = ToolContext {
            conversation_id: "c1".into(),
            ..ToolContext::default()
        };
        let t = Duration::from_secs(5);

        let added = tools
            .invoke("memory_add", json!({"content": "likes green tea", "category": "preference"}), &call, t)
            .await
            .unwrap();
        assert!(added.as_str().unwrap().starts_with("Stored in memory (id="));

        let found = tools.invoke("memory_search", json!({"query": "likes green tea"}), &call, t).await.unwrap();
        let found = found.as_str().unwrap();
        assert!(found.contains("[preference] likes green tea"), "{}", found);
        assert!(found.contains("(similarity: 1.00)"), "{}", found);

        let record = &ctx.memory.list(1).await.unwrap()[0];
        assert_eq!(record.metadata["conversation_id"], "c1");

        let deleted = tools
            .invoke("memory_delete", json!({"memory_id": record.id}), &call, t)
            .await
            .unwrap();
        assert_eq!(deleted, json!(format!("Deleted memory id={}", record.id)));
        let listed = tools.invoke("memory_list", json!({}), &call, t).await.unwrap();
        assert_eq!(listed, json!("No memories stored yet."));
    }

    #[tokio::test]
    async fn empty_content_is_a_tool_fault() {
        let ctx = test_context();
        let add = MemoryAdd(ctx.memory.clone());
        assert!(add.call(json!({"content": "  "}), &ToolContext::default()).await.is_err());
    }
}
