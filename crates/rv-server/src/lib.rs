//! rv-server: HTTP API server, upload session registry, and transcode queue.
//!
//! This crate ties together the other rv-* crates into a running server
//! application. It provides:
//!
//! - Axum-based HTTP API for resumable uploads, the asset catalog and
//!   byte-range delivery, with rate limiting and request ids
//! - Upload session registry with per-session gates and an expiry sweep
//! - Bounded-concurrency transcode queue with retries
//! - Graceful shutdown via signal handling

pub mod context;
pub mod error;
pub mod middleware;
pub mod router;
pub mod routes;
pub mod transcode;
pub mod uploads;

use std::net::SocketAddr;
use std::sync::Arc;

use rv_core::config::Config;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::context::AppContext;

/// Start the reelvault server.
///
/// Initializes storage, discovers ffmpeg, recovers interrupted transcodes,
/// and serves HTTP until a shutdown signal arrives. Background tasks are
/// stopped and awaited before returning.
pub async fn start(config: Config) -> rv_core::Result<()> {
    for warning in config.validate() {
        tracing::warn!("Config warning: {warning}");
    }

    prepare_dirs(&config)?;

    let db_path = &config.server.db_path;
    let existed = db_path.exists();
    let db = rv_db::pool::init_pool(db_path)?;
    if existed {
        tracing::info!("Database opened (existing) at {}", db_path.display());
    } else {
        tracing::info!("Database created (new) at {}", db_path.display());
    }

    let tools = Arc::new(rv_av::ToolRegistry::discover(&config.tools));
    for info in tools.check_all() {
        if info.available {
            tracing::info!(
                "Tool found: {} ({})",
                info.name,
                info.version.as_deref().unwrap_or("unknown version")
            );
        } else {
            tracing::warn!("Tool not found: {}", info.name);
        }
    }
    if !tools.can_transcode() {
        tracing::warn!("ffmpeg/ffprobe unavailable; uploads will be accepted but transcodes will fail");
    }

    let transcoder = Arc::new(rv_av::FfmpegTranscoder::new(
        tools.clone(),
        config.transcode.clone(),
    ));

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| rv_core::Error::Internal(format!("Invalid server address: {e}")))?;

    let ctx = AppContext::new(db, config, tools, transcoder);

    let recovered = ctx.queue.recover()?;
    if recovered > 0 {
        tracing::info!("Requeued {recovered} interrupted transcode job(s)");
    }

    let cancel = CancellationToken::new();
    let handles = spawn_background(&ctx, cancel.clone());

    let app = router::build_router(ctx);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| rv_core::Error::Internal(format!("Failed to bind to {addr}: {e}")))?;
    tracing::info!("Starting server on {addr}");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await;

    // Signal all background tasks to stop.
    cancel.cancel();
    for handle in handles {
        let _ = handle.await;
    }

    served.map_err(|e| rv_core::Error::Internal(format!("Server error: {e}")))?;
    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Create the database parent, scratch and media directories.
pub fn prepare_dirs(config: &Config) -> rv_core::Result<()> {
    if let Some(parent) = config.server.db_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
            tracing::info!("Created database directory {}", parent.display());
        }
    }
    std::fs::create_dir_all(config.server.scratch_dir())?;
    std::fs::create_dir_all(config.server.media_dir())?;
    Ok(())
}

/// Spawn the transcode dispatcher and the upload expiry sweeper.
///
/// Both stop when `cancel` fires; the dispatcher also waits for its running
/// jobs to wind down.
pub fn spawn_background(ctx: &AppContext, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
    let queue = ctx.queue.clone();
    let queue_cancel = cancel.clone();
    let queue_handle = tokio::spawn(async move {
        queue.run(queue_cancel).await;
    });

    let registry = ctx.uploads.clone();
    let interval = ctx.config.upload.sweep_interval();
    let sweep_handle = tokio::spawn(async move {
        uploads::sweep::run_sweeper(registry, interval, cancel).await;
    });

    vec![queue_handle, sweep_handle]
}

/// Wait for a shutdown signal (SIGINT or SIGTERM) or cancellation.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
        _ = cancel.cancelled() => {}
    }

    tracing::info!("Shutdown signal received");
}
