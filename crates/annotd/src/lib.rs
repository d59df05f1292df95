//! annotd - block annotation run daemon
//!
//! Hosts the overlay engine, the outbox relay feeding realtime subscribers,
//! the lease reaper and the HTTP control plane.

pub mod engine;
pub mod fanout;
pub mod server;
pub mod storage;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use annot_core::EngineConfig;
use engine::Engine;
use fanout::{FanoutHub, Relay};
use server::AppState;
use storage::Storage;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub const DEFAULT_PORT: u16 = 7710;

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Path to the SQLite database.
    pub db_path: PathBuf,
    /// HTTP server port (default: 7710).
    pub port: u16,
    /// Bearer token required on every route but /health.
    pub auth_token: Option<String>,
    pub engine: EngineConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            port: DEFAULT_PORT,
            auth_token: std::env::var("ANNOTD_AUTH_TOKEN").ok(),
            engine: EngineConfig::default(),
        }
    }
}

/// Get the default database path (~/.local/share/annotd/annotd.db).
pub fn default_db_path() -> PathBuf {
    let data_dir = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".local/share")
        });
    data_dir.join("annotd").join("annotd.db")
}

/// Daemon state.
#[derive(Debug)]
pub struct Daemon {
    config: DaemonConfig,
    engine: Arc<Engine>,
    hub: Arc<FanoutHub>,
    cancel: CancellationToken,
}

impl Daemon {
    pub async fn new(config: DaemonConfig) -> Result<Self, storage::StorageError> {
        let storage = Storage::new(&config.db_path).await?;
        storage.migrate_embedded().await?;

        let engine = Arc::new(Engine::new(Arc::new(storage), config.engine.clone()));
        let hub = Arc::new(FanoutHub::new(config.engine.fanout_capacity));

        Ok(Self {
            config,
            engine,
            hub,
            cancel: CancellationToken::new(),
        })
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Run the relay, the reaper and the HTTP server until shutdown.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        info!("annotd starting on port {}", self.config.port);
        info!("database: {}", self.config.db_path.display());
        info!(
            max_attempts = self.config.engine.max_attempts,
            lease_sec = self.config.engine.lease_duration_sec,
            "engine configured"
        );
        if self.config.auth_token.is_some() {
            info!("auth token: enabled");
        }

        let relay = Relay::new(
            Arc::clone(self.engine.storage()),
            Arc::clone(&self.hub),
            self.engine.commit_signal(),
            self.config.engine.relay_poll(),
        )
        .await?;
        let relay_handle = tokio::spawn(relay.run(self.cancel.clone()));

        let reaper_handle = match self.config.engine.reap_interval() {
            Some(interval) => Some(tokio::spawn(reap_loop(
                Arc::clone(&self.engine),
                interval,
                self.cancel.clone(),
            ))),
            None => {
                info!("lease reaper disabled");
                None
            }
        };

        let state = Arc::new(AppState {
            engine: Arc::clone(&self.engine),
            hub: Arc::clone(&self.hub),
            auth_token: self.config.auth_token.clone(),
        });
        let result = server::start_server(state, self.config.port, self.cancel.clone()).await;

        // The server only returns on shutdown or bind failure; stop the rest.
        self.cancel.cancel();
        if let Err(e) = relay_handle.await {
            warn!("relay task ended abnormally: {}", e);
        }
        if let Some(handle) = reaper_handle {
            if let Err(e) = handle.await {
                warn!("reaper task ended abnormally: {}", e);
            }
        }

        result?;
        info!("annotd stopped");
        Ok(())
    }

    /// Stop accepting claims and begin graceful shutdown.
    pub fn shutdown(&self) {
        self.engine.shutdown();
        self.cancel.cancel();
    }
}

/// Periodically fail final-attempt claims whose lease ran out.
async fn reap_loop(engine: Arc<Engine>, interval: Duration, cancel: CancellationToken) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }
        match engine.reap_expired_leases().await {
            Ok(0) => {}
            Ok(reaped) => info!(reaped, "reaped expired leases"),
            Err(e) => error!("lease reaper failed: {}", e),
        }
    }
}
