//! peerindexd — peer content index daemon.
//!
//! Usage: peerindexd [storage-path]

use std::path::PathBuf;

use anyhow::{Context, Result};

use peerindex_core::config::IndexConfig;
use peerindex_services::FsContentStore;
use peerindexd::Daemon;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = IndexConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = IndexConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        IndexConfig::default()
    });

    if let Some(path) = std::env::args().nth(1) {
        config.transfer.storage_path = PathBuf::from(path);
    }

    let store = FsContentStore::new(config.transfer.storage_path.clone()).with_context(|| {
        format!(
            "failed to open content store at {}",
            config.transfer.storage_path.display()
        )
    })?;
    tracing::info!(path = %store.root().display(), "content store ready");
    tracing::info!(
        max_contents_per_peer = config.registry.max_contents_per_peer,
        max_concurrent_transfers = config.transfer.max_concurrent_transfers,
        idle_timeout_secs = config.transfer.idle_timeout_secs,
        "peerindexd starting"
    );

    let daemon = Daemon::bind(config, store).await?;

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    daemon.run(shutdown_tx).await
}
