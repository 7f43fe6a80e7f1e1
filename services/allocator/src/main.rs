//! metalloc allocator
//!
//! Matches allocation requests against the bare-metal node inventory and
//! serves the allocation REST API.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use metalloc_allocator::{
    allocation::{AllocationError, AllocationService},
    api,
    config::{self, StorageBackend},
    model::NewNode,
    notify::TracingNotifier,
    state::AppState,
    store::{Database, Storage},
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Prefer RUST_LOG, fall back to METALLOC_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting metalloc allocator");
    info!(
        listen_addr = %config.listen_addr,
        storage = ?config.storage,
        workers = config.dispatch_workers,
        "Configuration loaded"
    );

    let storage = match config.storage {
        StorageBackend::Memory => Storage::memory(),
        StorageBackend::Postgres => {
            let db = match Database::connect(&config.database).await {
                Ok(db) => db,
                Err(e) => {
                    error!(error = %e, "Failed to connect to database");
                    return Err(e.into());
                }
            };

            if config.dev_mode {
                info!("Running database migrations (dev mode)");
                if let Err(e) = db.run_migrations().await {
                    error!(error = %e, "Failed to run migrations");
                    return Err(e.into());
                }
            }
            Storage::postgres(db)
        }
    };

    let service = Arc::new(AllocationService::new(
        &storage,
        Arc::new(TracingNotifier),
        config.dispatcher_config(),
    ));

    if let Some(path) = &config.nodes_file {
        let enrolled = enroll_nodes_file(&service, path).await?;
        info!(path = %path.display(), enrolled, "Node inventory loaded");
    }

    let interrupted = service.recover_interrupted().await?;
    if interrupted > 0 {
        info!(count = interrupted, "Recovered interrupted allocations");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let state = AppState::new(service.clone(), storage);
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for matching workers to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);
    if tokio::time::timeout(shutdown_timeout, service.shutdown())
        .await
        .is_err()
    {
        warn!("Matching workers did not shut down in time");
    }

    info!("Allocator shutdown complete");
    Ok(())
}

/// Enrolls every node in a JSON array file, skipping ones already enrolled.
async fn enroll_nodes_file(service: &AllocationService, path: &Path) -> Result<usize> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read nodes file {}", path.display()))?;
    let nodes: Vec<NewNode> = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse nodes file {}", path.display()))?;

    let mut enrolled = 0;
    for node in nodes {
        match service.enroll_node(node).await {
            Ok(_) => enrolled += 1,
            Err(AllocationError::Duplicate(message)) => {
                warn!(%message, "Skipping node already in the inventory");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(enrolled)
}
