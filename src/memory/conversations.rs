use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

use super::ConversationStore;
use crate::platform::ThreadKey;

/// SQLite-backed thread mappings that survive restarts
#[derive(Clone)]
pub struct SqliteConversationStore {
    conn: Arc<Mutex<Connection>>,
    ttl: Duration,
}

impl SqliteConversationStore {
    /// Open or create the database at the given path.
    pub fn open(path: &Path, ttl: Duration) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        // journal_mode PRAGMA always returns the resulting mode, so use query_row
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;

        Self::run_migrations(&conn)?;

        info!("Conversation store initialized at: {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            ttl,
        })
    }

    /// Open an in-memory database (for testing)
    #[cfg(test)]
    pub fn open_in_memory(ttl: Duration) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            ttl,
        })
    }

    fn run_migrations(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS thread_conversations (
                channel TEXT NOT NULL,
                thread_ts TEXT NOT NULL,
                conversation_id TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (channel, thread_ts)
            );

            CREATE INDEX IF NOT EXISTS idx_thread_conversations_updated
                ON thread_conversations(updated_at);
            ",
        )
        .context("Failed to run conversation store migrations")?;
        Ok(())
    }

    fn cutoff(&self) -> i64 {
        chrono::Utc::now().timestamp() - self.ttl.as_secs() as i64
    }
}

#[async_trait]
impl ConversationStore for SqliteConversationStore {
    async fn get(&self, thread: &ThreadKey) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        let found = conn.query_row(
            "SELECT conversation_id FROM thread_conversations
             WHERE channel = ?1 AND thread_ts = ?2 AND updated_at >= ?3",
            rusqlite::params![thread.channel, thread.thread, self.cutoff()],
            |row| row.get(0),
        );
        match found {
            Ok(id) => Ok(Some(id)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e).context("Failed to look up conversation"),
        }
    }

    async fn set(&self, thread: &ThreadKey, conversation_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO thread_conversations (channel, thread_ts, conversation_id, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(channel, thread_ts) DO UPDATE SET
                conversation_id = excluded.conversation_id,
                updated_at = excluded.updated_at",
            rusqlite::params![
                thread.channel,
                thread.thread,
                conversation_id,
                chrono::Utc::now().timestamp()
            ],
        )
        .context("Failed to store conversation")?;
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        let removed = conn
            .execute(
                "DELETE FROM thread_conversations WHERE updated_at < ?1",
                rusqlite::params![self.cutoff()],
            )
            .context("Failed to purge expired conversations")?;
        Ok(removed)
    }

    async fn len(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM thread_conversations", [], |row| {
                row.get(0)
            })
            .context("Failed to count conversations")?;
        Ok(count as usize)
    }
}
