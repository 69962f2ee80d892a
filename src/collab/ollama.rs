//! Ollama inference adapter
//!
//! Talks to an Ollama-compatible HTTP server. Used for both the local model
//! and, pointed at a different host, the external path.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::Inference;
use crate::error::CollabError;

/// Ollama adapter configuration
#[derive(Debug, Clone)]
pub struct OllamaConfig {
    pub url: String,
    pub embedding_model: String,
    pub temperature: f32,
    pub num_predict: u32,
    pub timeout: Duration,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:11434".to_string(),
            embedding_model: "nomic-embed-text".to_string(),
            temperature: 0.2,
            num_predict: 2048,
            timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

/// HTTP client for `/api/generate`, `/api/embeddings` and `/api/tags`
pub struct OllamaInference {
    config: OllamaConfig,
    client: reqwest::Client,
}

impl OllamaInference {
    pub fn new(config: OllamaConfig) -> Result<Self, CollabError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| CollabError::Unavailable(format!("http client: {}", e)))?;
        Ok(Self { config, client })
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }
}

fn map_reqwest(e: reqwest::Error) -> CollabError {
    if e.is_timeout() {
        CollabError::Transient(format!("ollama timeout: {}", e))
    } else if e.is_connect() {
        CollabError::Unavailable(format!("ollama unreachable: {}", e))
    } else if e.is_decode() {
        CollabError::Rejected(format!("unexpected ollama response: {}", e))
    } else {
        CollabError::Transient(e.to_string())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, CollabError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = format!("ollama error {}: {}", status, body);
    if status.is_server_error() || status.as_u16() == 429 {
        Err(CollabError::Transient(message))
    } else {
        Err(CollabError::Rejected(message))
    }
}

#[async_trait]
impl Inference for OllamaInference {
    async fn generate(&self, prompt: &str, model: &str) -> Result<String, CollabError> {
        let url = format!("{}/api/generate", self.config.url);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "model": model,
                "prompt": prompt,
                "stream": false,
                "options": {
                    "temperature": self.config.temperature,
                    "num_predict": self.config.num_predict,
                }
            }))
            .send()
            .await
            .map_err(map_reqwest)?;

        let result: GenerateResponse = check_status(response).await?.json().await.map_err(map_reqwest)?;
        debug!(model, chars = result.response.len(), "Ollama generation complete");
        Ok(result.response.trim().to_string())
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, CollabError> {
        let url = format!("{}/api/embeddings", self.config.url);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "model": self.config.embedding_model,
                "prompt": text,
            }))
            .send()
            .await
            .map_err(map_reqwest)?;

        let result: EmbeddingResponse = check_status(response).await?.json().await.map_err(map_reqwest)?;
        Ok(result.embedding)
    }

    async fn health(&self) -> Result<(), CollabError> {
        let response = self
            .client
            .get(format!("{}/api/tags", self.config.url))
            .timeout(Duration::from_secs(2))
            .send()
            .await
            .map_err(map_reqwest)?;
        check_status(response).await.map(|_| ())
    }
}
