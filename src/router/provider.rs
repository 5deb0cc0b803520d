//! LLM backend providers.
//!
//! `HttpProvider` speaks the OpenRouter-style chat-completions and embeddings
//! surface. `DeterministicProvider` is the terminal member of every chain: it
//! never fails, answering completions with the caller's neutral scaffold and
//! embeddings with a vector derived from a cryptographic hash of the prompt,
//! so the same prompt always yields the same vector.

use std::fmt;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

/// Dimension of every reasoning vector leaving the router. Provider output
/// of any other width is truncated or zero-padded so cosine is always
/// well-defined across the chain.
pub const REASONING_VECTOR_DIM: usize = 64;

/// One routed completion request. `neutral_response` is the schema-shaped
/// empty answer the terminal provider returns during upstream outages; the
/// caller owns its schema, so the caller supplies the scaffold.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub json_mode: bool,
    pub neutral_response: String,
}

/// Why a provider failed the current call. The router retries `RateLimited`
/// with backoff; everything else fails the provider immediately.
#[derive(Debug)]
pub enum ProviderError {
    RateLimited(String),
    Status(u16, String),
    Transport(String),
    Malformed(String),
    Timeout(u64),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::RateLimited(s) => write!(f, "rate limited: {s}"),
            ProviderError::Status(code, body) => write!(f, "http {code}: {body}"),
            ProviderError::Transport(s) => write!(f, "transport error: {s}"),
            ProviderError::Malformed(s) => write!(f, "malformed payload: {s}"),
            ProviderError::Timeout(secs) => write!(f, "timed out after {secs}s"),
        }
    }
}

impl std::error::Error for ProviderError {}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Terminal providers must always return a result; the router treats
    /// reaching one after failures as degraded service.
    fn is_terminal(&self) -> bool {
        false
    }

    async fn complete(&self, req: &CompletionRequest) -> Result<String, ProviderError>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;
}

// =============================================================================
// HTTP PROVIDER
// =============================================================================

#[derive(Debug, Clone)]
pub struct HttpProviderConfig {
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub embed_model: String,
}

pub struct HttpProvider {
    name: String,
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    embed_model: String,
}

impl HttpProvider {
    pub fn new(cfg: HttpProviderConfig) -> Result<Self> {
        if cfg.base_url.trim().is_empty() {
            return Err(anyhow!("provider {} has no base url", cfg.name));
        }
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .context("failed to build provider http client")?;
        Ok(Self {
            name: cfg.name,
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key,
            model: cfg.model,
            embed_model: cfg.embed_model,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post_json<B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<String, ProviderError> {
        let started = Instant::now();
        let resp = self
            .http
            .post(self.url(path))
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", self.api_key),
            )
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        debug!(
            provider = %self.name,
            path,
            status = status.as_u16(),
            latency_ms = started.elapsed().as_millis() as u64,
            "provider call"
        );

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let snippet: String = text.chars().take(200).collect();
            return Err(ProviderError::RateLimited(snippet));
        }
        if !status.is_success() {
            let snippet: String = text.chars().take(800).collect();
            return Err(ProviderError::Status(status.as_u16(), snippet));
        }
        Ok(text)
    }
}

#[async_trait]
impl LlmProvider for HttpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, req: &CompletionRequest) -> Result<String, ProviderError> {
        let body = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: req.system.clone(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: req.prompt.clone(),
                },
            ],
            temperature: Some(req.temperature),
            max_tokens: Some(req.max_tokens),
            response_format: req.json_mode.then(|| ResponseFormat {
                format_type: "json_object".to_string(),
            }),
        };

        let raw = self.post_json("/chat/completions", &body).await?;
        let parsed: ChatCompletionResponse = serde_json::from_str(&raw)
            .map_err(|e| ProviderError::Malformed(format!("chat response: {e}")))?;
        let content = parsed
            .choices
            .first()
            .and_then(|c| c.message.as_ref())
            .map(|m| m.content.clone())
            .ok_or_else(|| ProviderError::Malformed("chat response had no choices".to_string()))?;
        Ok(content)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let body = EmbeddingsRequest {
            model: self.embed_model.clone(),
            input: text.to_string(),
        };
        let raw = self.post_json("/embeddings", &body).await?;
        let parsed: EmbeddingsResponse = serde_json::from_str(&raw)
            .map_err(|e| ProviderError::Malformed(format!("embeddings response: {e}")))?;
        let vector = parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| ProviderError::Malformed("embeddings response empty".to_string()))?;
        if vector.is_empty() {
            return Err(ProviderError::Malformed(
                "embeddings vector empty".to_string(),
            ));
        }
        Ok(vector)
    }
}

// =============================================================================
// DETERMINISTIC TERMINAL PROVIDER
// =============================================================================

/// Rule-based fallback that guarantees the pipeline completes during
/// upstream outages.
pub struct DeterministicProvider;

#[async_trait]
impl LlmProvider for DeterministicProvider {
    fn name(&self) -> &str {
        "deterministic"
    }

    fn is_terminal(&self) -> bool {
        true
    }

    async fn complete(&self, req: &CompletionRequest) -> Result<String, ProviderError> {
        if req.neutral_response.trim().is_empty() {
            return Ok("{}".to_string());
        }
        Ok(req.neutral_response.clone())
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        Ok(hash_vector(text))
    }
}

/// Expand a SHA-256 digest of the text into a fixed-width vector in
/// [-1, 1]. Same prompt, same vector, by construction.
pub fn hash_vector(text: &str) -> Vec<f32> {
    let mut out = Vec::with_capacity(REASONING_VECTOR_DIM);
    let mut counter: u32 = 0;
    while out.len() < REASONING_VECTOR_DIM {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        hasher.update(counter.to_le_bytes());
        for byte in hasher.finalize() {
            out.push(byte as f32 / 127.5 - 1.0);
            if out.len() == REASONING_VECTOR_DIM {
                break;
            }
        }
        counter += 1;
    }
    out
}

// =============================================================================
// WIRE DTOS
// =============================================================================

#[derive(Debug, Clone, Serialize)]
struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
}

#[derive(Debug, Clone, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    pub format_type: String,
}

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionResponse {
    pub choices: Vec<ChatChoice>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoice {
    pub message: Option<ChatMessageOut>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatMessageOut {
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
struct EmbeddingsRequest {
    pub model: String,
    pub input: String,
}

#[derive(Debug, Clone, Deserialize)]
struct EmbeddingsResponse {
    pub data: Vec<EmbeddingsDatum>,
}

#[derive(Debug, Clone, Deserialize)]
struct EmbeddingsDatum {
    pub embedding: Vec<f32>,
}
