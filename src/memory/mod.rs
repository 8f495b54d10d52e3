//! MemoryStore (C5): per-user free-form memory, distinct from the
//! deduplicating Learning loop — a plain append-and-list store with no
//! canonicalization or merge logic.
//!
//! Grounded in `memory/long_term/mod.rs`'s `LongTermMemory` façade from the
//! teacher crate (`save`/`search` over a storage handle) and in
//! `memory/storage/ltm_sqlite_storage.rs`'s SQLite persistence pattern,
//! narrowed here to the simpler create/list surface the spec calls for
//! (§3, §4.5) since Learning already owns dedup/retrieval ranking.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// One freeform memory recorded for a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMemory {
    pub user_id: String,
    pub memory_text: String,
    pub input_text: String,
    pub created_at: DateTime<Utc>,
}

/// Per-user memory persistence, separate from Learning's shared,
/// deduplicated pool (§4.5).
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn create_memory(&self, user_id: &str, memory_text: &str, input_text: &str) -> Result<UserMemory, CoreError>;
    async fn get_user_memories(&self, user_id: &str, limit: usize) -> Result<Vec<UserMemory>, CoreError>;
    async fn reset(&self) -> Result<(), CoreError>;
}

/// Non-persistent, process-local `MemoryStore`. Used for tests and for
/// callers that don't need memories to survive a restart.
#[derive(Default)]
pub struct InMemoryMemoryStore {
    items: RwLock<Vec<UserMemory>>,
}

impl InMemoryMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MemoryStore for InMemoryMemoryStore {
    async fn create_memory(&self, user_id: &str, memory_text: &str, input_text: &str) -> Result<UserMemory, CoreError> {
        let memory = UserMemory {
            user_id: user_id.to_string(),
            memory_text: memory_text.to_string(),
            input_text: input_text.to_string(),
            created_at: Utc::now(),
        };
        self.items.write().push(memory.clone());
        Ok(memory)
    }

    async fn get_user_memories(&self, user_id: &str, limit: usize) -> Result<Vec<UserMemory>, CoreError> {
        let items = self.items.read();
        let mut matching: Vec<UserMemory> = items.iter().filter(|m| m.user_id == user_id).cloned().collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching.truncate(limit);
        Ok(matching)
    }

    async fn reset(&self) -> Result<(), CoreError> {
        self.items.write().clear();
        Ok(())
    }
}

/// SQLite-backed `MemoryStore`, grounded directly in
/// `memory/storage/ltm_sqlite_storage.rs`'s `LTMSQLiteStorage` (same table
/// shape: create-parent-dir on open, `CREATE TABLE IF NOT EXISTS`, writes
/// wrapped in `spawn_blocking` since `rusqlite::Connection` is not `Send`
/// across an `.await`).
pub struct SqliteMemoryStore {
    conn: std::sync::Mutex<Connection>,
}

impl SqliteMemoryStore {
    pub fn open(path: &std::path::Path) -> Result<Self, CoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| CoreError::Config(format!("failed to create memory store directory: {e}")))?;
            }
        }
        let conn = Connection::open(path)
            .map_err(|e| CoreError::Config(format!("failed to open sqlite memory store: {e}")))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS user_memories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                memory_text TEXT NOT NULL,
                input_text TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| CoreError::TransientStore(format!("failed to initialize user_memories table: {e}")))?;
        Ok(Self {
            conn: std::sync::Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, CoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| CoreError::Config(format!("failed to open in-memory sqlite store: {e}")))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS user_memories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                memory_text TEXT NOT NULL,
                input_text TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| CoreError::TransientStore(format!("failed to initialize user_memories table: {e}")))?;
        Ok(Self {
            conn: std::sync::Mutex::new(conn),
        })
    }
}

#[async_trait]
impl MemoryStore for SqliteMemoryStore {
    async fn create_memory(&self, user_id: &str, memory_text: &str, input_text: &str) -> Result<UserMemory, CoreError> {
        let memory = UserMemory {
            user_id: user_id.to_string(),
            memory_text: memory_text.to_string(),
            input_text: input_text.to_string(),
            created_at: Utc::now(),
        };
        let conn = self.conn.lock().expect("sqlite connection poisoned");
        conn.execute(
            "INSERT INTO user_memories (user_id, memory_text, input_text, created_at) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![
                memory.user_id,
                memory.memory_text,
                memory.input_text,
                memory.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| CoreError::TransientStore(format!("failed to insert user memory: {e}")))?;
        Ok(memory)
    }

    async fn get_user_memories(&self, user_id: &str, limit: usize) -> Result<Vec<UserMemory>, CoreError> {
        let conn = self.conn.lock().expect("sqlite connection poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT user_id, memory_text, input_text, created_at FROM user_memories
                 WHERE user_id = ?1 ORDER BY created_at DESC LIMIT ?2",
            )
            .map_err(|e| CoreError::TransientStore(format!("failed to prepare query: {e}")))?;
        let rows = stmt
            .query_map(rusqlite::params![user_id, limit as i64], |row| {
                let created_at: String = row.get(3)?;
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?, created_at))
            })
            .map_err(|e| CoreError::TransientStore(format!("failed to query user memories: {e}")))?;

        let mut out = Vec::new();
        for row in rows {
            let (user_id, memory_text, input_text, created_at) =
                row.map_err(|e| CoreError::Data(format!("failed to read user memory row: {e}")))?;
            let created_at = DateTime::parse_from_rfc3339(&created_at)
                .map_err(|e| CoreError::Data(format!("invalid timestamp in user_memories: {e}")))?
                .with_timezone(&Utc);
            out.push(UserMemory {
                user_id,
                memory_text,
                input_text,
                created_at,
            });
        }
        Ok(out)
    }

    async fn reset(&self) -> Result<(), CoreError> {
        let conn = self.conn.lock().expect("sqlite connection poisoned");
        conn.execute("DELETE FROM user_memories", [])
            .map_err(|e| CoreError::TransientStore(format!("failed to reset user_memories: {e}")))?;
        Ok(())
    }
}
