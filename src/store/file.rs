use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use super::{
    file_stem, read_json_or_default, write_json_atomic, ConversationStore, MemoryEntry, StoreError,
    Turn,
};

/// JSON-file backed [`ConversationStore`]
///
/// Writes for one user are serialized by a per-user lock.
pub struct FileStore {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl FileStore {
    /// Create a store rooted at `root` (created if missing)
    pub fn new(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
        })
    }

    fn lock_for(&self, user: &str) -> Arc<AsyncMutex<()>> {
        Arc::clone(self.locks.lock().entry(user.to_string()).or_default())
    }

    fn user_dir(&self, user: &str) -> PathBuf {
        self.root.join(file_stem(user))
    }

    fn session_path(&self, user: &str, session: &str) -> PathBuf {
        self.user_dir(user)
            .join("sessions")
            .join(format!("{}.json", file_stem(session)))
    }

    fn memory_path(&self, user: &str) -> PathBuf {
        self.user_dir(user).join("memory.json")
    }

    async fn load_memory(&self, user: &str) -> Result<BTreeMap<String, MemoryEntry>, StoreError> {
        read_json_or_default(&self.memory_path(user)).await
    }
}

#[async_trait]
impl ConversationStore for FileStore {
    async fn append(&self, user: &str, session: &str, turn: Turn) -> Result<(), StoreError> {
        let lock = self.lock_for(user);
        let _guard = lock.lock().await;

        let path = self.session_path(user, session);
        let mut turns: Vec<Turn> = read_json_or_default(&path).await?;
        turns.push(turn);
        write_json_atomic(&path, &turns).await?;
        debug!(user, session, turns = turns.len(), "turn appended");
        Ok(())
    }

    async fn history(&self, user: &str, session: &str) -> Result<Vec<Turn>, StoreError> {
        read_json_or_default(&self.session_path(user, session)).await
    }

    async fn get_memory(&self, user: &str) -> Result<BTreeMap<String, String>, StoreError> {
        Ok(self
            .load_memory(user)
            .await?
            .into_iter()
            .map(|(key, entry)| (key, entry.value))
            .collect())
    }

    async fn set_memory(
        &self,
        user: &str,
        key: &str,
        value: &str,
        protected: bool,
    ) -> Result<(), StoreError> {
        let lock = self.lock_for(user);
        let _guard = lock.lock().await;

        let mut memory = self.load_memory(user).await?;
        if !protected && memory.get(key).is_some_and(|entry| entry.protected) {
            return Err(StoreError::Protected(key.to_string()));
        }
        memory.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                protected,
                updated_at: Utc::now(),
            },
        );
        write_json_atomic(&self.memory_path(user), &memory).await
    }

    async fn clear_memory(&self, user: &str) -> Result<usize, StoreError> {
        let lock = self.lock_for(user);
        let _guard = lock.lock().await;

        let mut memory = self.load_memory(user).await?;
        let before = memory.len();
        memory.retain(|_, entry| entry.protected);
        let removed = before - memory.len();
        write_json_atomic(&self.memory_path(user), &memory).await?;
        Ok(removed)
    }
}
