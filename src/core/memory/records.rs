use anyhow::Result;
use chrono::Utc;
use rusqlite::{OptionalExtension, params};
use serde_json::Value;

use super::types::{MemoryRecord, ScoredMemory, blob_to_embedding, embedding_to_blob};
use super::{MemorySystem, from_micros, to_micros};

type RawRecord = (String, String, Vec<u8>, String, i64);

fn into_record((id, content, blob, metadata, created_at): RawRecord) -> Result<MemoryRecord> {
    Ok(MemoryRecord {
        id,
        content,
        embedding: blob_to_embedding(&blob),
        created_at: from_micros(created_at)?,
        metadata: serde_json::from_str(&metadata).unwrap_or(Value::Null),
    })
}

impl MemorySystem {
    pub async fn insert_memory(
        &self,
        content: &str,
        embedding: &[f32],
        metadata: &Value,
    ) -> Result<MemoryRecord> {
        let record = MemoryRecord {
            id: uuid::Uuid::new_v4().to_string(),
            content: content.to_string(),
            embedding: embedding.to_vec(),
            created_at: Utc::now(),
            metadata: metadata.clone(),
        };
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO memories (id, content, embedding, dim, metadata, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.id,
                record.content,
                embedding_to_blob(embedding),
                embedding.len() as i64,
                metadata.to_string(),
                to_micros(record.created_at),
            ],
        )?;
        Ok(record)
    }

    /// Nearest records by cosine distance; ties go to the newest.
    pub async fn nearest_memories(&self, query: &[f32], k: usize) -> Result<Vec<ScoredMemory>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, content, embedding, metadata, created_at, \
                    vec_distance_cosine(embedding, ?1) AS distance \
             FROM memories WHERE dim = ?2 \
             ORDER BY distance ASC, created_at DESC, rowid DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![embedding_to_blob(query), query.len() as i64, k as i64],
            |row| {
                Ok((
                    (
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                    ),
                    row.get::<_, f64>(5)?,
                ))
            },
        )?;

        let mut results = Vec::new();
        for row in rows {
            let (raw, distance) = row?;
            results.push(ScoredMemory {
                record: into_record(raw)?,
                distance: distance as f32,
            });
        }
        Ok(results)
    }

    pub async fn get_memory(&self, id: &str) -> Result<Option<MemoryRecord>> {
        let db = self.db.lock().await;
        let raw: Option<RawRecord> = db
            .query_row(
                "SELECT id, content, embedding, metadata, created_at FROM memories WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )
            .optional()?;
        raw.map(into_record).transpose()
    }

    /// Newest first.
    pub async fn list_memories(&self, limit: usize) -> Result<Vec<MemoryRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, content, embedding, metadata, created_at FROM memories \
             ORDER BY created_at DESC, rowid DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| -> rusqlite::Result<RawRecord> {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(into_record(row?)?);
        }
        Ok(results)
    }

    /// Returns whether a row was removed; unknown ids are not an error.
    pub async fn delete_memory(&self, id: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let rows_deleted = db.execute("DELETE FROM memories WHERE id = ?1", params![id])?;
        Ok(rows_deleted > 0)
    }
}
