use std::sync::Arc;

use anyhow::{Context, Result};

use drug_rag::api;
use drug_rag::config::AppConfig;
use drug_rag::rag::RagEngine;
use drug_rag::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let config = AppConfig::load().context("failed to load configuration")?;
    telemetry::init_tracing(&config.logging);

    tracing::info!("Storage backend: {:?}", config.storage);
    tracing::info!("Embedding provider: {:?}", config.embedding.provider);
    tracing::info!("Language model: {} ({})", config.llm.model, config.llm.base_url);

    let engine = RagEngine::from_config(&config)
        .await
        .context("failed to initialize RAG engine")?;
    tracing::info!("RAG engine initialized successfully");

    let app = api::router(
        Arc::new(engine),
        &config.server.allowed_origins,
        config.server.request_timeout(),
    );

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind_addr))?;
    tracing::info!("Drug RAG server listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("Shutting down");
}
