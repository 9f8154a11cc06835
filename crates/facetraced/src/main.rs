use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod error;
mod fetch;
mod routes;
mod store;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "facetraced starting");

    let config = config::Config::load().context("failed to load configuration")?;
    if config.secret.is_empty() {
        tracing::warn!("FACETRACE_SECRET is empty; requests must send an empty secret");
    }
    tracing::info!(
        model_dir = %config.model_dir.display(),
        db_path = %config.db_path.display(),
        listen_addr = %config.listen_addr,
        "configuration loaded"
    );

    // Model loading and the blocking HTTP client must stay off the async workers.
    let parts = {
        let config = config.clone();
        tokio::task::spawn_blocking(move || engine::load_parts(&config))
            .await
            .context("engine initialization panicked")??
    };
    let engine = engine::spawn_engine(parts)?;

    let state = routes::AppState {
        engine,
        secret: Arc::from(config.secret.as_str()),
        max_selfie_bytes: config.max_selfie_bytes,
    };
    let app = routes::routes(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, "facetraced ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    tracing::info!("facetraced shutting down");
    Ok(())
}
