//! HTTP server implementation.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::manager::RunnerManager;

use super::routes::routes;

/// Start the HTTP server; on shutdown, drain the manager.
pub async fn serve(manager: Arc<RunnerManager>) -> anyhow::Result<()> {
    let config = manager.config().clone();
    let app = routes(Arc::clone(&manager));

    #[cfg(unix)]
    if let Some(path) = config.ipc_socket.clone() {
        let ipc_app = routes(Arc::clone(&manager));
        tokio::spawn(async move {
            if let Err(e) = serve_ipc_socket(path, ipc_app).await {
                tracing::error!(error = %e, "IPC socket listener failed");
            }
        });
    }

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("Starting coglet server on {}", actual_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(
            config.await_explicit_shutdown,
            manager.shutdown_rx(),
        ))
        .await?;

    info!("Server shutdown complete");

    manager.stop().await;

    Ok(())
}

/// Serve the same routes on a unix socket for workers that cannot reach the
/// TCP listener.
#[cfg(unix)]
async fn serve_ipc_socket(
    path: std::path::PathBuf,
    app: axum::Router,
) -> anyhow::Result<()> {
    if path.exists() {
        std::fs::remove_file(&path)?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = tokio::net::UnixListener::bind(&path)?;
    info!(path = %path.display(), "Serving IPC on unix socket");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Resolve when the server should begin draining: SIGINT, SIGTERM (unless
/// suppressed), or the manager's shutdown channel (`POST /shutdown`).
///
/// Only the TCP listener drains gracefully. The unix-socket IPC listener
/// runs on a detached task and is simply dropped with the process; workers
/// are already being told to exit by the manager drain, so late pings on
/// that socket have nothing left to update.
///
/// # Panics
///
/// Panics if a signal handler cannot be registered, which means the process
/// signal mask or runtime is broken in a way no request could survive;
/// better to die during startup than serve without a shutdown path.
async fn shutdown_signal(await_explicit_shutdown: bool, mut shutdown_rx: watch::Receiver<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("SIGINT handler registration failed");
    };

    #[cfg(unix)]
    let terminate = async {
        if await_explicit_shutdown {
            // Kubernetes sends SIGTERM to every pod member at once; with
            // this flag set only SIGINT or /shutdown ends the drain.
            tracing::info!("await_explicit_shutdown enabled, ignoring SIGTERM");
            std::future::pending::<()>().await
        } else {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("SIGTERM handler registration failed")
                .recv()
                .await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let explicit_shutdown = async {
        while !*shutdown_rx.borrow() {
            if shutdown_rx.changed().await.is_err() {
                // Manager gone; nobody can request shutdown this way anymore
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {
            info!("SIGINT received, draining");
        }
        _ = terminate => {
            info!("SIGTERM received, draining");
        }
        _ = explicit_shutdown => {
            info!("Shutdown endpoint hit, draining");
        }
    }
}
