use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod app;
mod auth;
mod config;
mod db;
mod error;
mod mailer;
mod memory;
mod metrics;
mod routes;
mod state;
mod storage;
mod tasks;

use crate::config::AppConfig;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let env_filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "tokengate=debug,axum=info,tower_http=info".to_string());
    let json_logs = std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let config = AppConfig::from_env()?;
    let shutdown_grace = config.shutdown_grace;
    let state = AppState::init(config).await?;
    let tasks = state.tasks.clone();
    let config = state.config.clone();

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let app = app::build_app(state);
    app::serve(app, &config, shutdown).await?;

    if !tasks.drain(shutdown_grace).await {
        error!("exiting with background tasks still running");
    }
    info!("stopped server");
    Ok(())
}

/// Cancels `token` on ctrl-c or SIGTERM.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!(signal = "ctrl-c", "shutting down server"),
        _ = terminate => info!(signal = "SIGTERM", "shutting down server"),
    }
    token.cancel();
}
