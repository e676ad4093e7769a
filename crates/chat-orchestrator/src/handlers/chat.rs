use axum::{
    extract::{Path, State},
    Json,
};
use std::sync::Arc;
use tracing::info;

use crate::config::FlowConfig;
use crate::models::chat::{
    CaptureRequest, ChatRequest, ChatResponse, ConsentRequest, RecordResponse,
};
use crate::services::orchestrator::FlowStatus;
use crate::services::ResponseOrchestrator;
use crate::utils::error::ApiError;

pub async fn chat_handler(
    State(orchestrator): State<Arc<ResponseOrchestrator>>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let user_type = request.user_type.unwrap_or_default();

    info!(
        "Chat request: session={:?}, user_type={}, message_len={}",
        request.session_id,
        user_type.as_str(),
        request.message.len()
    );

    let reply = orchestrator
        .answer(request.session_id.as_deref(), &request.message, user_type)
        .await?;

    let answer = reply.answer.as_ref();
    Ok(Json(ChatResponse {
        session_id: reply.session_id,
        response: answer.text.clone(),
        sources: answer.sources.clone(),
        model: answer.model_id.clone(),
        action_type: answer.action_type,
        next_flow_state: reply.next_flow_state,
        content_filtered: answer.content_filtered,
        cached: reply.cached,
        timestamp: chrono::Utc::now(),
    }))
}

pub async fn capture_handler(
    State(orchestrator): State<Arc<ResponseOrchestrator>>,
    Json(request): Json<CaptureRequest>,
) -> Result<Json<RecordResponse>, ApiError> {
    let email = request.contact.email.trim();
    if email.is_empty() || !email.contains('@') {
        return Err(ApiError::BadRequest("A valid email is required".to_string()));
    }

    let outcome = orchestrator.record_data_capture(&request.session_id, request.contact.clone())?;

    Ok(Json(RecordResponse {
        session_id: request.session_id,
        recorded: outcome.recorded,
        flow_state: outcome.flow_state,
    }))
}

pub async fn consent_handler(
    State(orchestrator): State<Arc<ResponseOrchestrator>>,
    Json(request): Json<ConsentRequest>,
) -> Result<Json<RecordResponse>, ApiError> {
    let outcome = orchestrator.record_consent(&request.session_id, request.consent_types)?;

    Ok(Json(RecordResponse {
        session_id: request.session_id,
        recorded: outcome.recorded,
        flow_state: outcome.flow_state,
    }))
}

pub async fn flow_state_handler(
    State(orchestrator): State<Arc<ResponseOrchestrator>>,
    Path(session_id): Path<String>,
) -> Result<Json<FlowStatus>, ApiError> {
    Ok(Json(orchestrator.flow_state(&session_id)?))
}

pub async fn flow_config_handler(
    State(orchestrator): State<Arc<ResponseOrchestrator>>,
) -> Json<FlowConfig> {
    Json(orchestrator.flow_configuration().clone())
}
