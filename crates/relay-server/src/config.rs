//! Relay server configuration

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::auth::TokenValidator;
use crate::chat::ChatService;
use crate::store::ChatStore;
use crate::ws::ConnectionRegistry;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(
        "keepalive timings must satisfy write_wait < ping_period < read_wait \
         (got write_wait={write_wait:?}, ping_period={ping_period:?}, read_wait={read_wait:?})"
    )]
    InvalidKeepAlive {
        read_wait: Duration,
        write_wait: Duration,
        ping_period: Duration,
    },

    #[error("sink capacity must be at least 1")]
    InvalidSinkCapacity,
}

/// Per-connection liveness timings
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeepAlive {
    /// Silence allowed from the peer before the connection is considered dead
    pub read_wait: Duration,
    /// Upper bound on a single frame write
    pub write_wait: Duration,
    /// How often a ping is sent
    pub ping_period: Duration,
}

impl Default for KeepAlive {
    fn default() -> Self {
        Self {
            read_wait: Duration::from_secs(10),
            write_wait: Duration::from_secs(1),
            ping_period: Duration::from_secs(9),
        }
    }
}

impl KeepAlive {
    /// Derive the ping period as 9/10 of `read_wait`.
    pub fn new(read_wait: Duration, write_wait: Duration) -> Result<Self, ConfigError> {
        let keepalive = Self {
            read_wait,
            write_wait,
            ping_period: read_wait * 9 / 10,
        };
        keepalive.validate()?;
        Ok(keepalive)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.write_wait < self.ping_period && self.ping_period < self.read_wait {
            Ok(())
        } else {
            Err(ConfigError::InvalidKeepAlive {
                read_wait: self.read_wait,
                write_wait: self.write_wait,
                ping_period: self.ping_period,
            })
        }
    }
}

/// Configuration for the relay server
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Address to listen on
    pub addr: SocketAddr,
    /// Snapshot file, restored at startup and rewritten on shutdown
    pub snapshot_path: PathBuf,
    /// Base URL of the identity service that validates bearer tokens
    pub auth_url: String,
    /// Also snapshot periodically when set
    pub snapshot_interval: Option<Duration>,
    pub keepalive: KeepAlive,
    /// Bound of each user's delivery queue
    pub sink_capacity: usize,
    /// How long shutdown waits for open connections to wind down
    pub shutdown_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            addr: std::env::var("RELAY_ADDR")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8001))),
            snapshot_path: relay_common::snapshot_path(),
            auth_url: std::env::var("RELAY_AUTH_URL")
                .unwrap_or_else(|_| "http://localhost:8000".to_string()),
            snapshot_interval: std::env::var("RELAY_SNAPSHOT_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            keepalive: KeepAlive::default(),
            sink_capacity: 64,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl RelayConfig {
    /// Create config with the snapshot stored under `data_dir`
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            snapshot_path: relay_common::snapshot_path_in(&data_dir.into()),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.keepalive.validate()?;
        if self.sink_capacity == 0 {
            return Err(ConfigError::InvalidSinkCapacity);
        }
        Ok(())
    }
}

/// App state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RelayConfig>,
    pub store: Arc<ChatStore>,
    pub registry: Arc<ConnectionRegistry>,
    pub service: Arc<ChatService>,
    pub auth: Arc<dyn TokenValidator>,
    /// Process-wide shutdown signal
    pub shutdown: CancellationToken,
    /// Live connection pumps
    pub pumps: TaskTracker,
}
