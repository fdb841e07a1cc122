use clap::Parser;
use relay_server::auth::{HttpTokenValidator, StaticTokenValidator, TokenGrant, TokenValidator};
use relay_server::config::RelayConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "relay-server")]
#[command(about = "Real-time chat relay over WebSockets")]
struct Cli {
    /// Address to listen on
    #[arg(short, long)]
    addr: Option<SocketAddr>,

    /// Data directory; the snapshot is kept at <DATA_DIR>/snapshot.json
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Persist --data-dir as the default data root for later runs
    #[arg(long, requires = "data_dir")]
    remember_data_dir: bool,

    /// Explicit snapshot file, overrides --data-dir
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Base URL of the identity service
    #[arg(long)]
    auth_url: Option<String>,

    /// Also snapshot every N seconds
    #[arg(long, value_name = "SECS")]
    snapshot_interval: Option<u64>,

    /// Accept TOKEN for USER without asking the identity service (repeatable)
    #[arg(long = "dev-token", value_name = "TOKEN=USER")]
    dev_tokens: Vec<TokenGrant>,

    /// Verbose logging
    #[arg(short, long)]
    debug: bool,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<(RelayConfig, Vec<TokenGrant>)> {
        let mut config = match self.data_dir {
            Some(dir) => {
                if self.remember_data_dir {
                    relay_common::remember_root(&dir)?;
                    info!("Saved {:?} as the default data root", dir);
                }
                RelayConfig::with_data_dir(dir)
            }
            None => RelayConfig::default(),
        };
        if let Some(addr) = self.addr {
            config.addr = addr;
        }
        if let Some(path) = self.snapshot {
            config.snapshot_path = path;
        }
        if let Some(url) = self.auth_url {
            config.auth_url = url;
        }
        if let Some(secs) = self.snapshot_interval.filter(|secs| *secs > 0) {
            config.snapshot_interval = Some(Duration::from_secs(secs));
        }
        Ok((config, self.dev_tokens))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let (config, dev_tokens) = cli.into_config()?;

    info!("=== Chat Relay ===");
    info!("Snapshot file: {:?}", config.snapshot_path);

    let auth: Arc<dyn TokenValidator> = if dev_tokens.is_empty() {
        info!("Validating tokens against {}", config.auth_url);
        Arc::new(HttpTokenValidator::new(config.auth_url.clone())?)
    } else {
        warn!(
            "Using {} static dev tokens, identity service is not consulted",
            dev_tokens.len()
        );
        let mut validator = StaticTokenValidator::new();
        for grant in dev_tokens {
            validator.insert(grant);
        }
        Arc::new(validator)
    };

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    relay_server::run(config, auth, shutdown).await
}

async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Shutdown signal received");
    shutdown.cancel();
}
