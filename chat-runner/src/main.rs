use anyhow::Result;
use chat_api::{run as run_api, ApiState};
use chat_core::{ChatContext, Config};
use chat_messaging::sweeper::run as run_sweeper;
use tokio;
use tracing;
use tracing_subscriber;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Starting Talent Horizon chat server");

    let config = Config::from_env();
    let ctx = ChatContext::new(config).await?;

    tracing::info!("Chat context initialized");

    let state = ApiState::new(ctx);

    let service = state.service.clone();
    tokio::spawn(async move {
        if let Err(e) = run_sweeper(service).await {
            tracing::error!("Reconcile sweeper error: {}", e);
        }
    });

    tokio::select! {
        result = run_api(state) => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("Shutdown signal received"),
    }

    Ok(())
}
