use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use meshroom::{app_state::AppState, config::ServerConfig, server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("invalid log filter")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let state = AppState::new(config.ice());
    let app = server::router(state.clone(), &config.static_dir);

    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    info!(
        addr = %listener.local_addr()?,
        static_dir = %config.static_dir.display(),
        stun = ?config.ice().stun_url(),
        "meshroom relay listening"
    );

    let directory = state.directory.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "could not listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            info!("shutting down");
            directory.shutdown().await;
        })
        .await
        .context("server error")?;

    Ok(())
}
