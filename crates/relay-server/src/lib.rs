//! Chat Relay Server Library
//!
//! Clients hold a WebSocket to the relay; the relay routes chat messages
//! between connections by user identity and keeps chats in an in-memory
//! store that is snapshotted to disk.

pub mod auth;
pub mod chat;
pub mod config;
pub mod store;
pub mod ws;

use anyhow::Context;
use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use auth::TokenValidator;
use chat::ChatService;
use config::{AppState, RelayConfig};
use store::{spawn_snapshotter, ChatStore};
use ws::{ws_upgrade, ConnectionRegistry};

/// Routes served by the relay
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(ws_upgrade))
        .route("/ws", get(ws_upgrade))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

async fn health_check() -> &'static str {
    "OK"
}

/// A bound, not yet serving relay
pub struct RelayServer {
    listener: TcpListener,
    state: AppState,
    snapshotter: JoinHandle<()>,
}

impl RelayServer {
    /// Restore the store, start the snapshot task and bind the listener.
    ///
    /// Fails if the snapshot file exists but cannot be parsed.
    pub async fn bind(
        config: RelayConfig,
        auth: Arc<dyn TokenValidator>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<Self> {
        config.validate()?;

        let store = Arc::new(
            ChatStore::load(&config.snapshot_path)
                .await
                .context("Failed to restore chat store")?,
        );
        info!("Chat store ready with {} chats", store.len());

        let registry = Arc::new(ConnectionRegistry::new(config.sink_capacity));
        let service = Arc::new(ChatService::new(store.clone(), registry.clone()));

        let listener = TcpListener::bind(config.addr)
            .await
            .with_context(|| format!("Failed to bind {}", config.addr))?;

        let snapshotter = spawn_snapshotter(
            store.clone(),
            config.snapshot_path.clone(),
            config.snapshot_interval,
            shutdown.clone(),
        );

        let state = AppState {
            config: Arc::new(config),
            store,
            registry,
            service,
            auth,
            shutdown,
            pumps: TaskTracker::new(),
        };

        Ok(Self {
            listener,
            state,
            snapshotter,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Serve until the shutdown token fires, then wind down: stop
    /// accepting, give open connections `shutdown_grace` to close, and
    /// wait for the final snapshot.
    pub async fn run(self) -> anyhow::Result<()> {
        let Self {
            listener,
            state,
            snapshotter,
        } = self;

        info!("Chat relay listening on {}", listener.local_addr()?);

        let app = build_router(state.clone());
        let shutdown = state.shutdown.clone();
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;

        // Make sure everything else winds down even if serving failed
        state.shutdown.cancel();

        state.pumps.close();
        if tokio::time::timeout(state.config.shutdown_grace, state.pumps.wait())
            .await
            .is_err()
        {
            warn!(
                "{} connections still open after {:?}",
                state.pumps.len(),
                state.config.shutdown_grace
            );
        }

        if let Err(e) = snapshotter.await {
            error!("Snapshot task failed: {}", e);
        }

        info!("Chat relay stopped");
        served.context("Server error")
    }
}

/// Bind and serve with the given configuration until `shutdown` fires.
pub async fn run(
    config: RelayConfig,
    auth: Arc<dyn TokenValidator>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    RelayServer::bind(config, auth, shutdown).await?.run().await
}
