mod jobs;
mod records;
mod session;
pub mod store;
pub mod types;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, ffi::sqlite3_auto_extension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::info;

use crate::platform::{NativePlatform, Platform};

pub use store::MemoryStore;
pub use types::{MemoryRecord, ScoredMemory};

pub const DB_FILE: &str = "squidbot.db";

static SQLITE_VEC: Once = Once::new();

/// Load the sqlite-vec extension into every connection opened afterwards.
fn register_sqlite_vec() {
    SQLITE_VEC.call_once(|| unsafe {
        sqlite3_auto_extension(Some(std::mem::transmute::<
            *const (),
            unsafe extern "C" fn(
                *mut rusqlite::ffi::sqlite3,
                *mut *mut std::os::raw::c_char,
                *const rusqlite::ffi::sqlite3_api_routines,
            ) -> std::os::raw::c_int,
        >(sqlite_vec::sqlite3_vec_init as *const ())));
    });
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS memories (
    id TEXT PRIMARY KEY,
    content TEXT NOT NULL,
    embedding BLOB NOT NULL,
    dim INTEGER NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_memories_created ON memories(created_at);

CREATE TABLE IF NOT EXISTS session_turns (
    conversation_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    tool_calls TEXT,
    tool_call_id TEXT,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (conversation_id, seq)
);

CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    trigger_spec TEXT NOT NULL,
    payload TEXT NOT NULL,
    next_fire_at INTEGER NOT NULL,
    last_fired_at INTEGER,
    enabled INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_jobs_next_fire ON jobs(enabled, next_fire_at);
";

/// Single SQLite database holding long-term memories, session transcripts
/// and scheduled jobs. Every statement runs under one connection lock so a
/// write is either fully visible or not at all.
pub struct MemorySystem {
    db: Arc<Mutex<Connection>>,
    data_dir: Option<PathBuf>,
}

impl MemorySystem {
    pub async fn new<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        if !data_dir.exists() {
            fs::create_dir_all(&data_dir).await?;
        }
        NativePlatform::restrict_dir_permissions(&data_dir);

        register_sqlite_vec();

        let db_path = data_dir.join(DB_FILE);
        let db = Connection::open(&db_path)?;
        NativePlatform::restrict_file_permissions(&db_path);
        db.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        db.execute_batch(SCHEMA)?;
        info!("Opened memory database at {}", db_path.display());

        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            data_dir: Some(data_dir),
        })
    }

    /// Non-durable database, for one-off runs.
    pub fn in_memory() -> Result<Self> {
        register_sqlite_vec();
        let db = Connection::open_in_memory()?;
        db.execute_batch(SCHEMA)?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            data_dir: None,
        })
    }

    pub fn data_dir(&self) -> Option<&Path> {
        self.data_dir.as_deref()
    }

    /// sqlite-vec build linked into this process.
    pub async fn vec_version(&self) -> Result<String> {
        let db = self.db.lock().await;
        Ok(db.query_row("SELECT vec_version()", [], |row| row.get(0))?)
    }
}

pub(crate) fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms).ok_or_else(|| anyhow!("timestamp out of range: {}", ms))
}

pub(crate) fn to_micros(t: DateTime<Utc>) -> i64 {
    t.timestamp_micros()
}

pub(crate) fn from_micros(us: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_micros(us).ok_or_else(|| anyhow!("timestamp out of range: {}", us))
}

/// Fresh in-memory database for unit tests.
#[cfg(test)]
pub fn test_memory_system() -> Arc<MemorySystem> {
    Arc::new(MemorySystem::in_memory().expect("open in-memory db"))
}
