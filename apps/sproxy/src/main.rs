use anyhow::Result;
use axum::http::StatusCode;
use axum::routing::get;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let boot = sproxy_core::bootstrap::bootstrap_from_env().await?;

    let app = axum::Router::new()
        .merge(sproxy_router::openai_router(boot.state.clone()))
        .route("/favicon.ico", get(|| async { StatusCode::NO_CONTENT }))
        .route("/healthz", get(|| async { "ok" }));

    let bind = format!("{}:{}", boot.host, boot.port);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(event = "listening", address = %bind);
    axum::serve(listener, app).await?;
    Ok(())
}
