pub mod conversations;
pub mod events;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::platform::ThreadKey;

pub use conversations::SqliteConversationStore;
pub use events::{SeenEvents, SEEN_EVENT_TTL};

/// Maps a chat thread to the backend conversation continuing it.
///
/// Last writer wins; entries may vanish at any time without affecting
/// correctness, the next turn simply starts a fresh conversation.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get(&self, thread: &ThreadKey) -> Result<Option<String>>;

    async fn set(&self, thread: &ThreadKey, conversation_id: &str) -> Result<()>;

    /// Drop entries older than the TTL, returning how many were removed
    async fn purge_expired(&self) -> Result<usize>;

    async fn len(&self) -> Result<usize>;
}

struct Entry {
    conversation_id: String,
    updated_at: Instant,
}

/// Process-local store; mappings are lost on restart
pub struct InMemoryConversationStore {
    entries: RwLock<HashMap<ThreadKey, Entry>>,
    ttl: Duration,
}

impl InMemoryConversationStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn get(&self, thread: &ThreadKey) -> Result<Option<String>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(thread)
            .filter(|e| e.updated_at.elapsed() <= self.ttl)
            .map(|e| e.conversation_id.clone()))
    }

    async fn set(&self, thread: &ThreadKey, conversation_id: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.insert(
            thread.clone(),
            Entry {
                conversation_id: conversation_id.to_string(),
                updated_at: Instant::now(),
            },
        );
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.updated_at.elapsed() <= self.ttl);
        Ok(before - entries.len())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.entries.read().await.len())
    }
}
