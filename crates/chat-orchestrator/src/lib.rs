//! Conversational response orchestrator: answers questions about one
//! knowledge domain from retrieved context while walking each session
//! through a welcome / contact-capture / consent engagement flow.

pub mod config;
pub mod handlers;
pub mod logging;
pub mod models;
pub mod services;
pub mod state;
pub mod utils;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};

use state::AppState;

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/chat", post(handlers::chat_handler))
        .route("/chat/capture", post(handlers::capture_handler))
        .route("/chat/consent", post(handlers::consent_handler))
        .route("/flow/config", get(handlers::flow_config_handler))
        .route("/flow/{session_id}", get(handlers::flow_state_handler));

    Router::new()
        .route("/health", get(handlers::health_check))
        .nest("/api/v1", api)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http().make_span_with(DefaultMakeSpan::default()))
        .with_state(state)
}
