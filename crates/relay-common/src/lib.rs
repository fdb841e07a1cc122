//! Shared pieces of the chat relay
//!
//! - [`protocol`]: identities and the JSON envelopes exchanged over the socket
//! - data directory layout used by the server for its snapshot file
//!
//! Directory layout:
//! ```text
//! relay_data/
//! └── snapshot.json    # Store snapshot, rewritten wholesale on shutdown
//! ```

pub mod protocol;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::warn;

pub use protocol::{
    ChatId, Delivery, ErrorBody, Message, MessageDelivery, MessageId, MessageKind, NewChatRequest,
    NewMessageRequest, ProtocolError, Request, UserId,
};

/// Environment variable overriding the data root
pub const ROOT_ENV: &str = "RELAY_ROOT";

const DEFAULT_ROOT: &str = "relay_data";

/// Contents of the file written by `relay-server --remember-data-dir`
#[derive(Serialize, Deserialize, Debug, PartialEq)]
struct RememberedRoot {
    data_root: PathBuf,
}

/// `<platform config dir>/chat-relay/data-root.json`
fn remembered_root_file() -> Option<PathBuf> {
    Some(dirs::config_dir()?.join("chat-relay").join("data-root.json"))
}

fn read_remembered_root(file: &Path) -> Option<PathBuf> {
    let content = match fs::read_to_string(file) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return None,
        Err(e) => {
            warn!("Ignoring unreadable {:?}: {}", file, e);
            return None;
        }
    };

    serde_json::from_str::<RememberedRoot>(&content)
        .inspect_err(|e| warn!("Ignoring malformed {:?}: {}", file, e))
        .ok()
        .map(|remembered| remembered.data_root)
}

fn write_remembered_root(file: &Path, root: &Path) -> anyhow::Result<()> {
    if let Some(dir) = file.parent() {
        fs::create_dir_all(dir).with_context(|| format!("creating {:?}", dir))?;
    }
    let json = serde_json::to_vec_pretty(&RememberedRoot {
        data_root: root.to_path_buf(),
    })?;
    fs::write(file, json).with_context(|| format!("writing {:?}", file))
}

/// Data root recorded by an earlier `--remember-data-dir`, if any
pub fn remembered_root() -> Option<PathBuf> {
    read_remembered_root(&remembered_root_file()?)
}

/// Record `root` as the data root for later runs.
pub fn remember_root(root: &Path) -> anyhow::Result<()> {
    let file = remembered_root_file().context("no platform config directory")?;
    write_remembered_root(&file, root)
}

/// Data root: `RELAY_ROOT`, then the remembered root, then `relay_data`
pub fn data_root() -> PathBuf {
    std::env::var_os(ROOT_ENV)
        .map(PathBuf::from)
        .or_else(remembered_root)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ROOT))
}

/// Default snapshot file inside a data root
pub fn snapshot_path_in(root: &Path) -> PathBuf {
    root.join("snapshot.json")
}

/// Snapshot file under the resolved data root
pub fn snapshot_path() -> PathBuf {
    snapshot_path_in(&data_root())
}
