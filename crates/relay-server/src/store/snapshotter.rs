//! Background snapshot task
//!
//! Snapshots on a fixed period when one is configured, and always once
//! more when shutdown is signalled. Shutdown awaits the returned handle so
//! the final snapshot is on disk before the process exits.

use crate::store::ChatStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub fn spawn_snapshotter(
    store: Arc<ChatStore>,
    path: PathBuf,
    interval: Option<Duration>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match interval {
            Some(period) => {
                let mut ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => {
                            debug!("Periodic snapshot");
                            store.snapshot(&path).await;
                        }
                    }
                }
            }
            None => shutdown.cancelled().await,
        }

        store.snapshot(&path).await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_common::UserId;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_snapshot_on_shutdown() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("snapshot.json");
        let store = Arc::new(ChatStore::new());
        store.create_chat(vec![UserId::from("alice")]).unwrap();

        let shutdown = CancellationToken::new();
        let handle = spawn_snapshotter(store.clone(), path.clone(), None, shutdown.clone());

        assert!(!path.exists());
        shutdown.cancel();
        handle.await.unwrap();

        let restored = ChatStore::load(&path).await.unwrap();
        assert_eq!(restored.export(), store.export());
    }

    #[tokio::test]
    async fn test_periodic_snapshot() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("snapshot.json");
        let store = Arc::new(ChatStore::new());
        store.create_chat(vec![UserId::from("alice")]).unwrap();

        let shutdown = CancellationToken::new();
        let handle = spawn_snapshotter(
            store.clone(),
            path.clone(),
            Some(Duration::from_millis(20)),
            shutdown.clone(),
        );

        // Written without any shutdown signal
        let mut waited = Duration::ZERO;
        while !path.exists() && waited < Duration::from_secs(5) {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += Duration::from_millis(10);
        }
        assert!(path.exists());

        shutdown.cancel();
        handle.await.unwrap();
    }
}
