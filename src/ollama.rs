//! HTTP client for a local Ollama instance.
//!
//! [`OllamaClient`] implements both [`Embedder`] and [`Generator`]:
//!
//! | Operation | Endpoint |
//! |-----------|----------|
//! | embed | `POST /api/embed {model, input}` |
//! | generate | `POST /api/generate {model, prompt, stream, options}` |
//! | list models | `GET /api/tags` |
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors and timeouts → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)
//!
//! Every request carries a bounded timeout. Embedding failures surface as
//! [`RagError::EmbeddingUnavailable`], generation failures as
//! [`RagError::AgentInvocationFailure`].

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{EmbeddingConfig, GenerationConfig};
use crate::embedding::Embedder;
use crate::error::{RagError, RagResult};
use crate::generation::{Generator, ModelConfig};

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    #[serde(default)]
    embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
    top_p: f32,
    top_k: u32,
    repeat_penalty: f32,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

impl<'a> GenerateRequest<'a> {
    fn new(prompt: &'a str, model: &'a ModelConfig, stream: bool) -> Self {
        Self {
            model: &model.name,
            prompt,
            stream,
            options: GenerateOptions {
                temperature: model.temperature,
                top_p: model.top_p,
                top_k: model.top_k,
                repeat_penalty: model.repeat_penalty,
            },
        }
    }
}

/// Retry and timeout policy for one family of requests.
#[derive(Debug, Clone, Copy)]
struct RequestPolicy {
    timeout: Duration,
    max_retries: u32,
}

/// Client for the embedding and generation endpoints.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    http: reqwest::Client,
    embed_url: String,
    generate_url: String,
    embed_model: String,
    batch_size: usize,
    embed_policy: RequestPolicy,
    generate_policy: RequestPolicy,
}

impl OllamaClient {
    pub fn new(embedding: &EmbeddingConfig, generation: &GenerationConfig) -> RagResult<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| RagError::EmbeddingUnavailable(format!("HTTP client: {}", e)))?;

        Ok(Self {
            http,
            embed_url: embedding.url.trim_end_matches('/').to_string(),
            generate_url: generation.url.trim_end_matches('/').to_string(),
            embed_model: embedding.model.clone(),
            batch_size: embedding.batch_size.max(1),
            embed_policy: RequestPolicy {
                timeout: Duration::from_secs(embedding.timeout_secs),
                max_retries: embedding.max_retries,
            },
            generate_policy: RequestPolicy {
                timeout: Duration::from_secs(generation.timeout_secs),
                max_retries: generation.max_retries,
            },
        })
    }

    /// Names of the models the server has pulled.
    pub async fn list_models(&self) -> RagResult<Vec<String>> {
        let response = self
            .http
            .get(format!("{}/api/tags", self.generate_url))
            .timeout(self.generate_policy.timeout)
            .send()
            .await
            .map_err(|e| {
                RagError::AgentInvocationFailure(format!(
                    "Ollama connection error (is Ollama running at {}?): {}",
                    self.generate_url, e
                ))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(RagError::AgentInvocationFailure(format!(
                "Ollama API error {}: {}",
                status, body_text
            )));
        }

        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|e| RagError::AgentInvocationFailure(e.to_string()))?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    async fn post_with_retry<B: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
        policy: RequestPolicy,
    ) -> Result<reqwest::Response, String> {
        let mut last_err = None;

        for attempt in 0..=policy.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                debug!(url, attempt, delay_secs = delay.as_secs(), "retrying Ollama request");
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .http
                .post(url)
                .timeout(policy.timeout)
                .json(body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    let message = format!("Ollama API error {}: {}", status, body_text);
                    if status.as_u16() == 429 || status.is_server_error() {
                        warn!(url, %status, "transient Ollama error");
                        last_err = Some(message);
                        continue;
                    }
                    return Err(message);
                }
                Err(e) => {
                    last_err = Some(format!(
                        "Ollama connection error (is Ollama running at {}?): {}",
                        url, e
                    ));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| "Ollama request failed after retries".to_string()))
    }

    async fn embed_batch(&self, model: &str, texts: &[String]) -> RagResult<Vec<Vec<f32>>> {
        let url = format!("{}/api/embed", self.embed_url);
        let response = self
            .post_with_retry(&url, &EmbedRequest { model, input: texts }, self.embed_policy)
            .await
            .map_err(RagError::EmbeddingUnavailable)?;

        let payload: EmbedResponse = response
            .json()
            .await
            .map_err(|e| RagError::EmbeddingUnavailable(format!("invalid embed response: {}", e)))?;

        if payload.embeddings.len() != texts.len() {
            return Err(RagError::EmbeddingUnavailable(format!(
                "expected {} vectors, got {}",
                texts.len(),
                payload.embeddings.len()
            )));
        }
        Ok(payload.embeddings)
    }
}

#[async_trait]
impl Embedder for OllamaClient {
    fn model_name(&self) -> &str {
        &self.embed_model
    }

    async fn embed(&self, model: &str, texts: &[String]) -> RagResult<Vec<Vec<f32>>> {
        if model.trim().is_empty() {
            return Err(RagError::EmbeddingUnavailable(
                "no embedding model configured".to_string(),
            ));
        }
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            vectors.extend(self.embed_batch(model, batch).await?);
        }
        Ok(vectors)
    }
}

#[async_trait]
impl Generator for OllamaClient {
    async fn generate(&self, prompt: &str, model: &ModelConfig) -> RagResult<String> {
        let url = format!("{}/api/generate", self.generate_url);
        let response = self
            .post_with_retry(&url, &GenerateRequest::new(prompt, model, false), self.generate_policy)
            .await
            .map_err(RagError::AgentInvocationFailure)?;

        let payload: GenerateChunk = response
            .json()
            .await
            .map_err(|e| RagError::AgentInvocationFailure(format!("invalid generate response: {}", e)))?;
        Ok(payload.response)
    }

    async fn generate_streaming(
        &self,
        prompt: &str,
        model: &ModelConfig,
        on_progress: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> RagResult<String> {
        let url = format!("{}/api/generate", self.generate_url);
        let mut response = self
            .post_with_retry(&url, &GenerateRequest::new(prompt, model, true), self.generate_policy)
            .await
            .map_err(RagError::AgentInvocationFailure)?;

        let mut text = String::new();
        let mut pending: Vec<u8> = Vec::new();

        loop {
            let bytes = response
                .chunk()
                .await
                .map_err(|e| RagError::AgentInvocationFailure(format!("stream interrupted: {}", e)))?;
            let Some(bytes) = bytes else { break };
            pending.extend_from_slice(&bytes);

            while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = pending.drain(..=pos).collect();
                if apply_stream_line(&line, &mut text, on_progress)? {
                    return Ok(text);
                }
            }
        }

        if !pending.is_empty() {
            apply_stream_line(&pending, &mut text, on_progress)?;
        }
        Ok(text)
    }
}

/// Fold one NDJSON line into `text`. Returns `true` once the server
/// reports `done`.
fn apply_stream_line(
    line: &[u8],
    text: &mut String,
    on_progress: &mut (dyn for<'a> FnMut(&'a str) + Send),
) -> RagResult<bool> {
    let trimmed = String::from_utf8_lossy(line);
    let trimmed = trimmed.trim();
    if trimmed.is_empty() {
        return Ok(false);
    }

    let chunk: GenerateChunk = serde_json::from_str(trimmed)
        .map_err(|e| RagError::AgentInvocationFailure(format!("invalid stream line: {}", e)))?;
    if !chunk.response.is_empty() {
        text.push_str(&chunk.response);
        on_progress(text.as_str());
    }
    Ok(chunk.done)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_lines_accumulate_until_done() {
        let mut text = String::new();
        let mut seen = Vec::new();
        let mut cb = |s: &str| seen.push(s.to_string());

        assert!(!apply_stream_line(br#"{"response":"Hel","done":false}"#, &mut text, &mut cb).unwrap());
        assert!(!apply_stream_line(b"   \n", &mut text, &mut cb).unwrap());
        assert!(apply_stream_line(br#"{"response":"lo","done":true}"#, &mut text, &mut cb).unwrap());

        assert_eq!(text, "Hello");
        assert_eq!(seen, vec!["Hel".to_string(), "Hello".to_string()]);
    }

    #[test]
    fn malformed_stream_line_is_invocation_failure() {
        let mut text = String::new();
        let mut cb = |_: &str| {};
        let err = apply_stream_line(b"not json", &mut text, &mut cb).unwrap_err();
        assert!(matches!(err, RagError::AgentInvocationFailure(_)));
    }

    #[test]
    fn generate_request_carries_sampling_options() {
        let model = ModelConfig::named("qwen2.5:7b");
        let req = GenerateRequest::new("hi", &model, false);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["model"], "qwen2.5:7b");
        assert_eq!(json["stream"], false);
        assert_eq!(json["options"]["top_k"], 40);
    }

    #[tokio::test]
    async fn empty_model_is_embedding_unavailable() {
        let client = OllamaClient::new(&EmbeddingConfig::default(), &GenerationConfig::default()).unwrap();
        let err = client.embed("", &["x".to_string()]).await.unwrap_err();
        assert!(matches!(err, RagError::EmbeddingUnavailable(_)));
        assert!(client.embed("m", &[]).await.unwrap().is_empty());
    }
}
