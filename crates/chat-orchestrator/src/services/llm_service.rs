use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::GenerationConfig;
use crate::services::providers::{Generation, GenerationProvider, GenerationRequest};
use crate::utils::error::BackendError;

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    top_p: f32,
    max_tokens: usize,
    stream: bool,
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletionResponse {
    #[serde(default)]
    pub choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub message: Option<ResponseMessage>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ResponseMessage {
    #[serde(default)]
    pub content: Option<String>,
}

/// OpenAI-compatible chat completion client (non-streaming).
#[derive(Clone)]
pub struct LlmService {
    client: Client,
    config: GenerationConfig,
}

impl LlmService {
    pub fn new(config: GenerationConfig, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build generation HTTP client")?;

        Ok(Self { client, config })
    }

    async fn complete_internal(&self, request: &GenerationRequest) -> Result<Generation> {
        debug!("Calling generation backend with {} chars prompt", request.prompt.len());

        let body = ChatCompletionRequest {
            model: &self.config.model,
            messages: vec![ChatMessage {
                role: "user",
                content: &request.prompt,
            }],
            temperature: request.temperature,
            top_p: request.top_p,
            max_tokens: request.max_tokens,
            stream: false,
        };

        let url = format!(
            "{}/v1/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let mut call = self.client.post(&url).json(&body);
        if let Some(key) = &self.config.api_key {
            call = call.bearer_auth(key);
        }

        let response = call.send().await.context("Failed to call LLM API")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("LLM API error: {} - {}", status, body);
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .context("Failed to parse LLM response")?;

        interpret_completion(parsed)
    }
}

#[async_trait]
impl GenerationProvider for LlmService {
    async fn complete(&self, request: GenerationRequest) -> Result<Generation, BackendError> {
        self.complete_internal(&request)
            .await
            .map_err(|e| BackendError::unavailable("generation", format!("{:#}", e)))
    }

    fn model_id(&self) -> String {
        self.config.model.clone()
    }
}

/// A `content_filter`/`safety` finish reason is a designed outcome, not an error.
pub fn interpret_completion(response: ChatCompletionResponse) -> Result<Generation> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .context("LLM response contained no choices")?;

    let finish_reason = choice.finish_reason.unwrap_or_default().to_lowercase();
    if finish_reason == "content_filter" || finish_reason == "safety" {
        warn!("Generation blocked by content filter ({})", finish_reason);
        return Ok(Generation {
            text: String::new(),
            safety_blocked: true,
        });
    }

    let text = choice
        .message
        .and_then(|m| m.content)
        .unwrap_or_default();

    if text.trim().is_empty() {
        anyhow::bail!("LLM returned an empty completion (finish_reason={})", finish_reason);
    }

    Ok(Generation {
        text,
        safety_blocked: false,
    })
}
