//! deskvault-node: runs the persistence core over a durable WAL backend.
//!
//! Loads config, opens the backend, builds the vault, starts quota
//! cleanup and the optional metrics endpoint, then waits for Ctrl+C.

use deskvault_common::SystemClock;
use deskvault_core::DeskVault;
use deskvault_storage::{FsyncPolicy, WalBackend};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    deskvault_metrics::init_tracing();

    // First CLI arg is the YAML config path
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "deskvault.yaml".to_string());

    let config = match deskvault_config::load_from_file(std::path::Path::new(&config_path)) {
        Ok(config) => config,
        Err(deskvault_config::ConfigError::Io(e)) => {
            tracing::warn!(
                "could not read config from {}: {}, using defaults",
                config_path,
                e
            );
            deskvault_config::VaultConfig::default()
        }
        // A config that exists but is wrong should stop the node.
        Err(e) => return Err(e.into()),
    };

    let fsync = FsyncPolicy::from_str_config(&config.storage.fsync);
    let backend = Arc::new(WalBackend::open(
        &config.storage.data_dir,
        fsync,
        config.storage.max_value_bytes,
    )?);
    tracing::info!(
        "opened store at {} (fsync {:?}, {}-byte values)",
        config.storage.data_dir.display(),
        fsync,
        config.storage.max_value_bytes
    );

    let vault = DeskVault::new(backend.clone(), &config, Arc::new(SystemClock))?;
    let cleanup = vault.spawn_quota_cleanup();

    if let Some(metrics_port) = config.metrics_port {
        let metrics_addr = std::net::SocketAddr::from(([0, 0, 0, 0], metrics_port));
        tokio::spawn(async move {
            if let Err(e) = deskvault_metrics::serve_metrics(metrics_addr).await {
                tracing::warn!("metrics server failed: {}", e);
            }
        });
        tracing::info!("serving metrics on {}", metrics_addr);
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("received Ctrl+C, shutting down");
    cleanup.abort();
    backend.sync().await?;

    Ok(())
}
