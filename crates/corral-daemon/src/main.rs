//! `corrald` entry point.

use corral_core::{DomainManager, EmulatorProcessManager, JsonFileStore};
use corral_daemon::{http, DaemonConfig};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("corral=info".parse()?))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Starting corrald");

    let config = DaemonConfig::from_env();
    tracing::info!(?config, "Configuration loaded");

    // Warn-only so the daemon still comes up on hosts without the emulator
    config.validate_warn();

    let core = config.manager_config();
    let store = Arc::new(JsonFileStore::new(&core.state_dir));
    let process = Arc::new(EmulatorProcessManager::new(&core));
    let manager = Arc::new(DomainManager::new(core, store, process)?);

    let loaded = manager.load_all().await?;
    tracing::info!(loaded, "Persistent domains loaded");

    let mut lifecycle = manager.subscribe();
    tokio::spawn(async move {
        loop {
            match lifecycle.recv().await {
                Ok(event) => tracing::info!(
                    domain = %event.domain,
                    kind = ?event.kind,
                    detail = %event.detail,
                    "Lifecycle event"
                ),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Lifecycle log fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let http_manager = Arc::clone(&manager);
    let http_addr = config.http_addr;
    let mut shutdown_rx = shutdown_tx.subscribe();
    let http_handle = tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.recv().await;
        };

        if let Err(e) = http::serve(http_manager, http_addr, shutdown).await {
            tracing::error!(error = %e, "HTTP server error");
        }
    });

    tracing::info!(%http_addr, "Daemon ready");

    signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, cleaning up...");

    let _ = shutdown_tx.send(());
    let _ = http_handle.await;

    // Running guests keep running; only the event worker is drained.
    manager.shutdown().await;

    tracing::info!("Daemon shutdown complete");
    Ok(())
}
