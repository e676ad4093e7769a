use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::config::EmbeddingConfig;
use crate::services::providers::EmbeddingProvider;
use crate::utils::error::BackendError;

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    content: &'a str,
    input: &'a str,
    model: &'a str,
}

/// HTTP client for a llama.cpp / OpenAI-style embedding server.
#[derive(Clone)]
pub struct EmbeddingService {
    client: Client,
    base_url: String,
    model: String,
    dimension: usize,
}

impl EmbeddingService {
    pub fn new(config: &EmbeddingConfig, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build embedding HTTP client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            dimension: config.dimension,
        })
    }

    async fn embed_internal(&self, text: &str) -> Result<Vec<f32>> {
        debug!("Generating embedding for {} chars", text.len());

        // Both field names are sent for compatibility.
        let request = EmbeddingRequest {
            content: text,
            input: text,
            model: &self.model,
        };

        let url = format!("{}/embedding", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .context("Failed to connect to embedding server")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Embedding API error ({}): {}", status, body);
        }

        let json: Value = response
            .json()
            .await
            .context("Failed to parse embedding response as JSON")?;

        parse_embedding(&json, self.dimension)
    }
}

#[async_trait]
impl EmbeddingProvider for EmbeddingService {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, BackendError> {
        self.embed_internal(text)
            .await
            .map_err(|e| BackendError::unavailable("embedding", format!("{:#}", e)))
    }
}

fn floats(values: &[Value]) -> Vec<f32> {
    values
        .iter()
        .filter_map(|v| v.as_f64().map(|f| f as f32))
        .collect()
}

/// Accepts `{"embedding": [..]}` (llama.cpp), `{"data": [{"embedding": [..]}]}`
/// (OpenAI), `[{"embedding": [..]}]` and a bare `[..]`.
pub fn parse_embedding(json: &Value, dimension: usize) -> Result<Vec<f32>> {
    let embedding = match json {
        Value::Array(items) => match items.first() {
            None => anyhow::bail!("Empty array returned from embedding server"),
            Some(Value::Object(first)) => match first.get("embedding") {
                Some(Value::Array(values)) => floats(values),
                _ => anyhow::bail!("Unrecognized embedding response format: {}", json),
            },
            Some(_) => floats(items),
        },
        Value::Object(obj) => match (obj.get("embedding"), obj.get("data")) {
            (Some(Value::Array(values)), _) => floats(values),
            (_, Some(Value::Array(data))) => match data.first().and_then(|d| d.get("embedding")) {
                Some(Value::Array(values)) => floats(values),
                _ => anyhow::bail!("Unrecognized embedding response format: {}", json),
            },
            _ => anyhow::bail!("Unrecognized embedding response format: {}", json),
        },
        _ => anyhow::bail!("Unrecognized embedding response format: {}", json),
    };

    if embedding.is_empty() {
        anyhow::bail!("Generated embedding is empty");
    }

    if embedding.len() != dimension {
        anyhow::bail!(
            "Embedding dimension mismatch: expected {}, got {}",
            dimension,
            embedding.len()
        );
    }

    Ok(embedding)
}
