//! In-memory chat storage with snapshot/restore
//!
//! The store is the source of truth for chats and their messages. All
//! mutations happen in memory under a short-lived lock; persistence is a
//! wholesale JSON snapshot written atomically to a single file and read
//! back once at startup.

use crate::store::StoreError;
use parking_lot::RwLock;
use relay_common::{ChatId, Message, UserId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use tokio::fs;
use tracing::{error, info};

pub type Result<T> = std::result::Result<T, StoreError>;

/// A chat with fixed membership and its message history in arrival order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    pub ch_id: ChatId,
    pub user_ids: BTreeSet<UserId>,
    pub messages: Vec<Message>,
}

/// Everything the store knows. This is also the snapshot file format.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreState {
    pub chats: HashMap<ChatId, Chat>,
}

/// Chat store shared by all sessions
#[derive(Default)]
pub struct ChatStore {
    state: RwLock<StoreState>,
}

impl ChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from a snapshot file, or an empty one if none exists.
    pub async fn load(path: &Path) -> Result<Self> {
        let store = Self::new();
        store.restore(path).await?;
        Ok(store)
    }

    /// Allocate a new chat with the given members.
    pub fn create_chat(&self, members: impl IntoIterator<Item = UserId>) -> Result<ChatId> {
        let user_ids: BTreeSet<UserId> = members.into_iter().collect();
        if user_ids.is_empty() {
            return Err(StoreError::EmptyMembers);
        }

        let mut state = self.state.write();
        let mut ch_id = ChatId::generate();
        while state.chats.contains_key(&ch_id) {
            ch_id = ChatId::generate();
        }

        state.chats.insert(
            ch_id.clone(),
            Chat {
                ch_id: ch_id.clone(),
                user_ids,
                messages: Vec::new(),
            },
        );

        Ok(ch_id)
    }

    pub fn append_message(&self, ch_id: &ChatId, message: Message) -> Result<()> {
        let mut state = self.state.write();
        let chat = state
            .chats
            .get_mut(ch_id)
            .ok_or_else(|| StoreError::ChatNotFound(ch_id.clone()))?;
        chat.messages.push(message);
        Ok(())
    }

    pub fn members_of(&self, ch_id: &ChatId) -> Result<Vec<UserId>> {
        let state = self.state.read();
        state
            .chats
            .get(ch_id)
            .map(|chat| chat.user_ids.iter().cloned().collect())
            .ok_or_else(|| StoreError::ChatNotFound(ch_id.clone()))
    }

    /// Messages of a chat in the order they were appended
    pub fn history(&self, ch_id: &ChatId) -> Result<Vec<Message>> {
        let state = self.state.read();
        state
            .chats
            .get(ch_id)
            .map(|chat| chat.messages.clone())
            .ok_or_else(|| StoreError::ChatNotFound(ch_id.clone()))
    }

    pub fn chat(&self, ch_id: &ChatId) -> Option<Chat> {
        self.state.read().chats.get(ch_id).cloned()
    }

    /// Copy of the full state
    pub fn export(&self) -> StoreState {
        self.state.read().clone()
    }

    pub fn len(&self) -> usize {
        self.state.read().chats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Best-effort snapshot: failures are logged, never returned.
    pub async fn snapshot(&self, path: &Path) {
        match self.write_snapshot(path).await {
            Ok(()) => info!("Snapshot saved to {:?}", path),
            Err(e) => error!("Failed to save snapshot to {:?}: {}", path, e),
        }
    }

    /// Serialize the whole store to `path`, replacing any previous file.
    pub async fn write_snapshot(&self, path: &Path) -> Result<()> {
        let json = {
            let state = self.state.read();
            serde_json::to_vec_pretty(&*state)?
        };

        let io_err = |source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        // Write next to the target, then rename over it
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, json).await.map_err(io_err)?;
        fs::rename(&temp_path, path).await.map_err(io_err)?;

        Ok(())
    }

    /// Replace the store contents with a snapshot file.
    ///
    /// A missing file leaves the store untouched (cold start). An unreadable
    /// or malformed file is an error.
    pub async fn restore(&self, path: &Path) -> Result<()> {
        let content = match fs::read(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No snapshot at {:?}, starting empty", path);
                return Ok(());
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let restored: StoreState =
            serde_json::from_slice(&content).map_err(|source| StoreError::CorruptSnapshot {
                path: path.to_path_buf(),
                source,
            })?;

        let count = restored.chats.len();
        *self.state.write() = restored;

        info!("Restored {} chats from {:?}", count, path);
        Ok(())
    }
}
