//! SQLite-backed chat turn store for the retrieval handler

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;

use crate::types::{ChatTurn, TurnRole};

pub const SESSION_TABLE: &str = "rag_agent_sessions";

/// Persists chat turns per session id
pub struct SessionStore {
    conn: Mutex<Connection>,
}

impl SessionStore {
    /// Open (or create) the store at `path`, creating parent directories
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open session db: {}", path.display()))?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().context("Failed to open in-memory db")?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_session ON {table}(session_id, id);",
            table = SESSION_TABLE
        ))
        .context("Failed to create session table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("session store lock poisoned"))
    }

    pub fn append(&self, session_id: &str, turn: &ChatTurn) -> Result<()> {
        self.lock()?
            .execute(
                &format!(
                    "INSERT INTO {} (session_id, role, content, created_at) VALUES (?1, ?2, ?3, ?4)",
                    SESSION_TABLE
                ),
                params![session_id, turn.role.as_str(), turn.content, turn.timestamp],
            )
            .context("Failed to append chat turn")?;
        Ok(())
    }

    /// The last `limit` turns of a session, oldest first
    pub fn recent(&self, session_id: &str, limit: usize) -> Result<Vec<ChatTurn>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT role, content, created_at FROM {} WHERE session_id = ?1 ORDER BY id DESC LIMIT ?2",
            SESSION_TABLE
        ))?;

        let rows = stmt.query_map(params![session_id, limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut turns = Vec::new();
        for row in rows {
            let (role, content, timestamp) = row?;
            // Rows with an unknown role were not written by this store
            if let Some(role) = TurnRole::parse(&role) {
                turns.push(ChatTurn {
                    role,
                    content,
                    timestamp,
                });
            }
        }
        turns.reverse();
        Ok(turns)
    }

    /// Remove a session's turns, returning how many were deleted
    pub fn clear(&self, session_id: &str) -> Result<usize> {
        let n = self.lock()?.execute(
            &format!("DELETE FROM {} WHERE session_id = ?1", SESSION_TABLE),
            params![session_id],
        )?;
        Ok(n)
    }
}
