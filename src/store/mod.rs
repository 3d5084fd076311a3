//! Conversation and memory storage
//!
//! Sessions keep an append-only log of chat turns; users keep a small
//! key-value memory shared by all their sessions. [`ConversationStore`] is the
//! seam; [`FileStore`] keeps everything as JSON files:
//!
//! ```text
//! <root>/<user>/memory.json
//! <root>/<user>/sessions/<session>.json
//! ```

mod file;

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

pub use file::FileStore;

/// Errors from the conversation store and other JSON-file state
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt state file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("memory key `{0}` is protected")]
    Protected(String),
}

/// Who said a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message in a session's history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub at: DateTime<Utc>,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            at: Utc::now(),
        }
    }
}

/// A remembered fact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub value: String,
    /// Survives `clear_memory` and unprotected overwrites
    pub protected: bool,
    pub updated_at: DateTime<Utc>,
}

/// Conversation history and memory, per user and session
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Append a turn to the session's log
    async fn append(&self, user: &str, session: &str, turn: Turn) -> Result<(), StoreError>;

    /// Full history of a session, oldest first
    async fn history(&self, user: &str, session: &str) -> Result<Vec<Turn>, StoreError>;

    /// The user's memory as key -> value
    async fn get_memory(&self, user: &str) -> Result<BTreeMap<String, String>, StoreError>;

    /// Store `key`; an unprotected write cannot replace a protected entry
    async fn set_memory(
        &self,
        user: &str,
        key: &str,
        value: &str,
        protected: bool,
    ) -> Result<(), StoreError>;

    /// Remove every unprotected entry; returns how many were removed
    async fn clear_memory(&self, user: &str) -> Result<usize, StoreError>;
}

/// Map an identifier onto a safe file stem
pub(crate) fn file_stem(id: &str) -> String {
    let stem: String = id
        .chars()
        .map(|c| match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '_' | '-' | '@' | '.' => c,
            _ => '_',
        })
        .collect();
    if stem.is_empty() || stem.chars().all(|c| c == '.') {
        format!("_{}", stem)
    } else {
        stem
    }
}

/// Read a JSON file, treating a missing file as the default value
pub(crate) async fn read_json_or_default<T>(path: &Path) -> Result<T, StoreError>
where
    T: DeserializeOwned + Default,
{
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

/// Write `value` as JSON via a temp file and rename
pub(crate) async fn write_json_atomic<T>(path: &Path, value: &T) -> Result<(), StoreError>
where
    T: Serialize + ?Sized,
{
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
