use anyhow::{Result, anyhow};
use rusqlite::params;

use super::{MemorySystem, from_micros, to_micros};
use crate::core::orchestrator::types::{Role, ToolCall, Turn};

type RawTurn = (i64, String, String, Option<String>, Option<String>, i64);

fn into_turn((seq, role, content, tool_calls, tool_call_id, created_at): RawTurn) -> Result<Turn> {
    let role = Role::parse(&role).ok_or_else(|| anyhow!("unknown turn role '{}'", role))?;
    let tool_calls: Vec<ToolCall> = match tool_calls {
        Some(json) => serde_json::from_str(&json)?,
        None => Vec::new(),
    };
    Ok(Turn {
        seq,
        role,
        content,
        tool_calls,
        tool_call_id,
        timestamp: from_micros(created_at)?,
    })
}

impl MemorySystem {
    /// Append `turns` to a conversation in one transaction. Sequence numbers
    /// continue from the current maximum; the stored turns are returned.
    pub async fn append_turns(&self, conversation_id: &str, turns: Vec<Turn>) -> Result<Vec<Turn>> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let last: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM session_turns WHERE conversation_id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )?;

        let mut stored = Vec::with_capacity(turns.len());
        {
            let mut stmt = tx.prepare(
                "INSERT INTO session_turns \
                 (conversation_id, seq, role, content, tool_calls, tool_call_id, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for (i, mut turn) in turns.into_iter().enumerate() {
                turn.seq = last + 1 + i as i64;
                let tool_calls = if turn.tool_calls.is_empty() {
                    None
                } else {
                    Some(serde_json::to_string(&turn.tool_calls)?)
                };
                stmt.execute(params![
                    conversation_id,
                    turn.seq,
                    turn.role.as_str(),
                    turn.content,
                    tool_calls,
                    turn.tool_call_id,
                    to_micros(turn.timestamp),
                ])?;
                stored.push(turn);
            }
        }
        tx.commit()?;
        Ok(stored)
    }

    /// The last `limit` turns in order. A window never opens on a tool
    /// result whose originating assistant turn fell outside it.
    pub async fn recent_turns(&self, conversation_id: &str, limit: usize) -> Result<Vec<Turn>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT seq, role, content, tool_calls, tool_call_id, created_at \
             FROM session_turns WHERE conversation_id = ?1 \
             ORDER BY seq DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(
            params![conversation_id, limit as i64],
            |row| -> rusqlite::Result<RawTurn> {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?))
            },
        )?;

        let mut turns = Vec::new();
        for row in rows {
            turns.push(into_turn(row?)?);
        }
        turns.reverse();
        let orphaned = turns.iter().take_while(|t| t.role == Role::Tool).count();
        turns.drain(..orphaned);
        Ok(turns)
    }

    /// Full transcript, for replay.
    pub async fn session_turns(&self, conversation_id: &str) -> Result<Vec<Turn>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT seq, role, content, tool_calls, tool_call_id, created_at \
             FROM session_turns WHERE conversation_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![conversation_id], |row| -> rusqlite::Result<RawTurn> {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?))
        })?;

        let mut turns = Vec::new();
        for row in rows {
            turns.push(into_turn(row?)?);
        }
        Ok(turns)
    }

    pub async fn turn_count(&self, conversation_id: &str) -> Result<usize> {
        let db = self.db.lock().await;
        let n: i64 = db.query_row(
            "SELECT COUNT(*) FROM session_turns WHERE conversation_id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }
}
