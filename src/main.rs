use anyhow::{Context, Result};
use axum::Router;
use std::{io::ErrorKind, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
mod state;

use config::{AppConfig, BackendKind};
use services::{
    backend::ObjectBackend, dispatcher::Dispatcher, local_store::LocalStore,
    memory_store::MemoryStore, s3_store::S3Store, shutdown::Shutdown,
};
use state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config ---
    let cfg = AppConfig::from_env_and_args()?;

    tracing::info!("Starting chatlog-sink with config: {:?}", cfg);

    // --- Initialize backend ---
    let backend = build_backend(&cfg).await?;
    anyhow::ensure!(
        cfg.min_chunk_size >= backend.min_part_size(),
        "min chunk size {} is below the {} backend's minimum part size {}",
        cfg.min_chunk_size,
        backend.name(),
        backend.min_part_size()
    );
    tracing::info!("Using {} backend", backend.name());

    // --- Start dispatcher ---
    let shutdown = Shutdown::new();
    let (dispatcher, client) =
        Dispatcher::new(backend.clone(), cfg.dispatcher_settings(), shutdown.clone());
    shutdown.spawn(dispatcher.run());

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(AppState {
        dispatcher: client,
        backend,
        shutdown: shutdown.clone(),
    });

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    // --- Drain partitions ---
    drain_after_serve(served, &shutdown).await?;
    tracing::info!("Finished");

    Ok(())
}

async fn build_backend(cfg: &AppConfig) -> Result<Arc<dyn ObjectBackend>> {
    let backend: Arc<dyn ObjectBackend> = match cfg.backend {
        BackendKind::Memory => Arc::new(MemoryStore::new(cfg.emulated_min_part_size)),
        BackendKind::Local => {
            tracing::debug!(
                "Opening local backend at {} (metadata {})",
                cfg.storage_dir,
                cfg.database_url
            );
            let store = LocalStore::connect(
                &cfg.database_url,
                &cfg.storage_dir,
                cfg.emulated_min_part_size,
            )
            .await
            .context("opening local backend")?;
            Arc::new(store)
        }
        BackendKind::S3 => {
            let bucket = cfg
                .bucket
                .as_deref()
                .context("--bucket or BUCKET_NAME is required for the s3 backend")?;
            Arc::new(S3Store::from_env(bucket, &cfg.region).context("configuring s3 backend")?)
        }
    };
    Ok(backend)
}

/// Cancel every partition and wait until each has flushed, whether or not
/// the server stopped cleanly. The server's result is passed through.
async fn drain_after_serve<E: std::fmt::Display>(
    served: Result<(), E>,
    shutdown: &Shutdown,
) -> Result<(), E> {
    if let Err(err) = &served {
        tracing::error!("HTTP server failed: {}", err);
    }
    tracing::info!("HTTP server stopped, flushing partitions");
    shutdown.trigger();
    shutdown.wait().await;
    served
}

/// Resolve on Ctrl-C or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!("Could not listen for Ctrl-C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!("Could not listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl-C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
