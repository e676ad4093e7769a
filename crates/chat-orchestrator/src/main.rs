use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use chat_orchestrator::build_router;
use chat_orchestrator::config::Settings;
use chat_orchestrator::logging::{ActivityLogger, LoggerConfig, TracingActivitySink};
use chat_orchestrator::services::{
    Backends, EmbeddingService, LlmService, ResponseOrchestrator, VectorIndex,
};
use chat_orchestrator::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,chat_orchestrator=debug".to_string()),
        )
        .with_target(true)
        .with_thread_ids(true)
        .json()
        .init();

    info!("Starting chat orchestrator...");

    let settings = Arc::new(Settings::load().context("Failed to load configuration")?);
    info!("Configuration loaded");

    let call_timeout = Duration::from_secs(settings.backend.call_timeout_seconds.max(1));
    let embedder = EmbeddingService::new(&settings.embedding, call_timeout)?;
    let generator = LlmService::new(settings.generation.clone(), call_timeout)?;
    let index = VectorIndex::load(&settings.retrieval.index_path, settings.embedding.dimension)
        .await?;

    let activity = ActivityLogger::new(Arc::new(TracingActivitySink), LoggerConfig::default());

    let orchestrator = Arc::new(ResponseOrchestrator::new(
        &settings,
        Backends {
            embedder: Arc::new(embedder),
            retriever: Arc::new(index),
            generator: Arc::new(generator),
        },
        activity,
    ));

    spawn_idle_sweeper(orchestrator.clone(), settings.memory.sweep_interval_seconds);

    let app = build_router(AppState::new(orchestrator));

    let addr = SocketAddr::from((
        settings.server.host.parse::<std::net::IpAddr>()?,
        settings.server.port,
    ));
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

fn spawn_idle_sweeper(orchestrator: Arc<ResponseOrchestrator>, interval_secs: u64) {
    if interval_secs == 0 {
        info!("Idle session sweeper disabled");
        return;
    }

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            orchestrator.sweep_idle();
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");
}
