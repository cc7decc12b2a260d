use anyhow::{Result, bail};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

use super::MemorySystem;
use super::types::{MemoryRecord, ScoredMemory};
use crate::core::llm::embedding::Embedder;

/// Long-term memory: content plus embedding, searchable by similarity.
pub struct MemoryStore {
    db: Arc<MemorySystem>,
    embedder: Arc<dyn Embedder>,
}

impl MemoryStore {
    pub fn new(db: Arc<MemorySystem>, embedder: Arc<dyn Embedder>) -> Self {
        Self { db, embedder }
    }

    pub async fn store(&self, content: &str, metadata: Value) -> Result<String> {
        let content = content.trim();
        if content.is_empty() {
            bail!("refusing to store an empty memory");
        }
        let embedding = self.embedder.embed(content).await?;
        let record = self.db.insert_memory(content, &embedding, &metadata).await?;
        info!("Stored memory {} ({} chars)", record.id, content.len());
        Ok(record.id)
    }

    /// The `k` most similar records, best first.
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<ScoredMemory>> {
        let embedding = self.embedder.embed(query).await?;
        let hits = self.db.nearest_memories(&embedding, k).await?;
        debug!("Memory search returned {} hit(s)", hits.len());
        Ok(hits)
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        self.db.delete_memory(id).await
    }

    pub async fn list(&self, limit: usize) -> Result<Vec<MemoryRecord>> {
        self.db.list_memories(limit).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<MemoryRecord>> {
        self.db.get_memory(id).await
    }
}
