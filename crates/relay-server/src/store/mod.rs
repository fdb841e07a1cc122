//! Chat storage module
//!
//! Keeps chats, memberships and messages in memory and persists them as
//! a single JSON snapshot file.

pub mod memory_store;
pub mod snapshotter;

pub use memory_store::{Chat, ChatStore, StoreState};
pub use snapshotter::spawn_snapshotter;

use relay_common::ChatId;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("chat {0} not found")]
    ChatNotFound(ChatId),

    #[error("a chat needs at least one member")]
    EmptyMembers,

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt snapshot {path:?}: {source}")]
    CorruptSnapshot {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
