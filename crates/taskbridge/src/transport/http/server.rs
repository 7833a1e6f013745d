//! HTTP server implementation.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::config::HttpConfig;
use crate::service::BridgeService;

use super::routes::routes;

/// Bind `config.host:config.port` and serve until shutdown.
pub async fn serve(config: HttpConfig, service: Arc<BridgeService>) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    serve_on(listener, service, config.await_explicit_shutdown).await
}

/// Serve on an already bound listener.
pub async fn serve_on(
    listener: TcpListener,
    service: Arc<BridgeService>,
    await_explicit_shutdown: bool,
) -> anyhow::Result<()> {
    let shutdown_rx = service.shutdown_rx();
    let app = routes(Arc::clone(&service));

    let actual_addr = listener.local_addr()?;
    info!("Starting taskbridge HTTP bridge on {}", actual_addr);

    let signal_service = Arc::clone(&service);
    let shutdown = async move {
        shutdown_signal(await_explicit_shutdown, shutdown_rx).await;
        // In-flight tool calls wait on the broker; close it before the drain.
        signal_service.shutdown();
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("Server shutdown complete");
    service.shutdown();

    Ok(())
}

/// Wait for shutdown signal (SIGTERM, SIGINT, or /shutdown endpoint).
///
/// If a signal handler cannot be installed, that source is logged and
/// ignored; the others still apply.
async fn shutdown_signal(await_explicit_shutdown: bool, mut shutdown_rx: watch::Receiver<bool>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await
        }
    };

    #[cfg(unix)]
    let terminate = async {
        if await_explicit_shutdown {
            tracing::info!("await_explicit_shutdown enabled, ignoring SIGTERM");
            std::future::pending::<()>().await
        } else {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await
                }
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let explicit_shutdown = async {
        while !*shutdown_rx.borrow() {
            if shutdown_rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
        _ = explicit_shutdown => {
            info!("Shutdown requested via /shutdown endpoint...");
        }
    }
}
