//! annotd - block annotation run daemon
//!
//! Main entry point for the daemon binary.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::path::PathBuf;

use annot_core::EngineConfig;
use annotd::{Daemon, DaemonConfig, DEFAULT_PORT};
use clap::Parser;
use eyre::WrapErr;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "annotd", about = "Block annotation run daemon", version)]
struct Cli {
    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// SQLite database path
    #[arg(long)]
    db: Option<PathBuf>,

    /// Engine config file (key=value lines)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the per-overlay retry budget
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Override the claim lease in seconds
    #[arg(long)]
    lease_sec: Option<u64>,

    /// Bearer token required by the HTTP API
    #[arg(long, env = "ANNOTD_AUTH_TOKEN", hide_env_values = true)]
    auth_token: Option<String>,
}

impl Cli {
    /// CLI flags > config file > defaults.
    fn daemon_config(&self) -> eyre::Result<DaemonConfig> {
        let mut engine = match &self.config {
            Some(path) => EngineConfig::from_file(path)
                .wrap_err_with(|| format!("loading {}", path.display()))?,
            None => EngineConfig::default(),
        };
        if let Some(max_attempts) = self.max_attempts {
            eyre::ensure!(max_attempts > 0, "--max-attempts must be at least 1");
            engine.max_attempts = max_attempts;
        }
        if let Some(lease_sec) = self.lease_sec {
            eyre::ensure!(lease_sec > 0, "--lease-sec must be at least 1");
            engine.lease_duration_sec = lease_sec;
        }

        let mut config = DaemonConfig {
            port: self.port,
            auth_token: self.auth_token.clone(),
            engine,
            ..Default::default()
        };
        if let Some(db) = &self.db {
            config.db_path.clone_from(db);
        }
        Ok(config)
    }
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = cli.daemon_config()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to create tokio runtime")?;

    runtime.block_on(async {
        let daemon = Daemon::new(config)
            .await
            .wrap_err("failed to initialize daemon")?;

        let run = daemon.run();
        tokio::pin!(run);

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm =
                signal(SignalKind::terminate()).wrap_err("failed to register SIGTERM handler")?;
            let mut sigint =
                signal(SignalKind::interrupt()).wrap_err("failed to register SIGINT handler")?;

            tokio::select! {
                result = &mut run => return report(result),
                _ = sigint.recv() => info!("received SIGINT, initiating graceful shutdown"),
                _ = sigterm.recv() => info!("received SIGTERM, initiating graceful shutdown"),
            }
        }

        #[cfg(not(unix))]
        {
            tokio::select! {
                result = &mut run => return report(result),
                _ = tokio::signal::ctrl_c() => {
                    info!("received SIGINT, initiating graceful shutdown");
                }
            }
        }

        daemon.shutdown();
        report(run.await)
    })
}

fn report(result: Result<(), Box<dyn std::error::Error>>) -> eyre::Result<()> {
    if let Err(e) = result {
        error!("daemon error: {}", e);
        eyre::bail!("daemon exited with error: {e}");
    }
    Ok(())
}
