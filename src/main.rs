use std::net::SocketAddr;
use std::sync::Arc;

use local_llm_service::api::{self, AppState};
use local_llm_service::config::Config;
use local_llm_service::models::{CandleLoader, ModelHandler};
use tokio::signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let config = Config::load()?;

    // HuggingFace tokenizers can interfere with Tokio's async runtime;
    // single-threaded tokenization is sufficient at this request volume.
    std::env::set_var("TOKENIZERS_PARALLELISM", "false");
    std::env::set_var("RAYON_NUM_THREADS", config.model.num_threads.to_string());

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.server.log_level)),
        )
        .with_target(false)
        .init();

    tracing::info!("🚀 Starting Local LLM Service");
    tracing::info!(
        model = %config.model.default_key,
        max_context = config.model.max_context,
        threads = config.model.num_threads,
        auth = config.api_key.is_some(),
        "service configuration"
    );

    // One handler per process; pre-load the default model before accepting
    // traffic so the first request pays no cold-start penalty.
    let mut handler = ModelHandler::new(
        &config.model.default_key,
        config.model.clone(),
        Arc::new(CandleLoader),
    )?;
    handler.load().await?;
    tracing::info!("✅ Model loaded successfully");

    let host = config.server.host.clone();
    let port = config.server.port;
    let state = AppState::new(handler, config);
    let app = api::router(state);

    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    tracing::info!("🌐 Server starting on http://{}", addr);
    tracing::info!("📡 Available endpoints:");
    tracing::info!("  • GET  /              - Service status");
    tracing::info!("  • GET  /models        - Available models");
    tracing::info!("  • POST /generate      - Text generation");
    tracing::info!("  • GET  /documentation - API documentation");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("👋 Server shutdown complete");
    Ok(())
}

// Handles both interactive (Ctrl+C) and system (SIGTERM) shutdown signals.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("🛑 Shutdown signal received");
}
