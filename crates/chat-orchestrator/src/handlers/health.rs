use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::services::response_cache::CacheStats;
use crate::services::ResponseOrchestrator;

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    version: String,
    active_sessions: usize,
    cache: CacheStats,
}

pub async fn health_check(
    State(orchestrator): State<Arc<ResponseOrchestrator>>,
) -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            active_sessions: orchestrator.memory().active_sessions(),
            cache: orchestrator.cache().stats(),
        }),
    )
}
