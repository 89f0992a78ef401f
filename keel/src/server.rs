//! Process lifecycle: serve until a shutdown signal, then tear down

use crate::config::ServerConfig;
use crate::routes::router;
use crate::state::AppState;
use keel_channel::{spawn_session_sweeper, SweeperConfig};
use tokio_util::sync::CancellationToken;

pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let state = AppState::from_config(&config)?;
    let shutdown = state.shutdown.clone();

    let sweeper = spawn_session_sweeper(
        state.sessions.clone(),
        SweeperConfig {
            interval: config.sweep_interval(),
        },
        shutdown.clone(),
    );

    let listener = tokio::net::TcpListener::bind(config.listen).await?;
    tracing::info!(
        listen = %config.listen,
        storage_root = %state.registry.storage_root().display(),
        require_encryption = state.require_encryption,
        session_ttl_secs = config.session_ttl_secs,
        "Keel listening"
    );

    axum::serve(listener, router(state.clone()))
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    if let Err(e) = sweeper.await {
        tracing::warn!(error = %e, "Session sweeper ended abnormally");
    }
    state.registry.shutdown().await;
    state.sessions.clear();

    tracing::info!("Keel stopped");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to listen for Ctrl+C");
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
                tracing::error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = shutdown.cancelled() => {},
    }

    tracing::info!("Shutdown signal received");
    shutdown.cancel();
}
