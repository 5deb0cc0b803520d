//! Resilient LLM Router
//!
//! Every reasoning call in the pipeline goes through here. Providers are
//! tried in configured order; a provider fails the current call on transport
//! error, HTTP 5xx, 429 after the retry budget, timeout, or malformed
//! payload. The chain ends in a deterministic provider that always answers,
//! so the pipeline completes during upstream outages; the caller sees
//! `degraded = true` and records UPSTREAM_UNAVAILABLE.
//!
//! The router is stateless across calls; a process-wide semaphore caps
//! concurrent outbound calls.

pub mod provider;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use rand::Rng;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, warn};

pub use provider::{
    hash_vector, CompletionRequest, DeterministicProvider, HttpProvider, HttpProviderConfig,
    LlmProvider, ProviderError, REASONING_VECTOR_DIM,
};

/// Retry budget for HTTP 429, per provider per call.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Wall-clock budget per provider attempt.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Process-wide concurrent outbound call ceiling.
pub const DEFAULT_MAX_CONCURRENT_CALLS: usize = 8;

const BACKOFF_BASE_MS: u64 = 200;

/// A routed result plus where it came from. `degraded` means at least one
/// non-terminal provider failed and the terminal provider answered.
#[derive(Debug, Clone)]
pub struct RouterOutcome<T> {
    pub value: T,
    pub provider: String,
    pub degraded: bool,
}

pub struct RouterConfig {
    pub max_retries: u32,
    pub call_timeout: Duration,
    pub max_concurrent_calls: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            max_concurrent_calls: DEFAULT_MAX_CONCURRENT_CALLS,
        }
    }
}

pub struct LlmRouter {
    providers: Vec<Arc<dyn LlmProvider>>,
    semaphore: Arc<Semaphore>,
    max_retries: u32,
    call_timeout: Duration,
}

impl LlmRouter {
    pub fn new(providers: Vec<Arc<dyn LlmProvider>>, config: RouterConfig) -> Self {
        Self {
            providers,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_calls.max(1))),
            max_retries: config.max_retries,
            call_timeout: config.call_timeout,
        }
    }

    /// Convenience: the given chain terminated by the deterministic provider.
    pub fn with_deterministic_tail(
        mut providers: Vec<Arc<dyn LlmProvider>>,
        config: RouterConfig,
    ) -> Self {
        providers.push(Arc::new(DeterministicProvider));
        Self::new(providers, config)
    }

    /// Routed completion. In JSON mode the returned string is the extracted,
    /// strictly-parsed JSON substring of the completion.
    pub async fn complete(&self, req: &CompletionRequest) -> Result<RouterOutcome<String>> {
        self.route(|provider| {
            let req = req.clone();
            async move {
                let content = provider.complete(&req).await?;
                if req.json_mode {
                    extract_json(&content).map_err(ProviderError::Malformed)
                } else {
                    Ok(content)
                }
            }
        })
        .await
    }

    /// Routed reasoning vector, normalized to `REASONING_VECTOR_DIM`.
    pub async fn reasoning_vector(&self, prompt: &str) -> Result<RouterOutcome<Vec<f32>>> {
        let outcome = self
            .route(|provider| {
                let prompt = prompt.to_string();
                async move { provider.embed(&prompt).await }
            })
            .await?;
        Ok(RouterOutcome {
            value: normalize_dim(outcome.value),
            provider: outcome.provider,
            degraded: outcome.degraded,
        })
    }

    async fn route<T, F, Fut>(&self, call: F) -> Result<RouterOutcome<T>>
    where
        F: Fn(Arc<dyn LlmProvider>) -> Fut,
        Fut: std::future::Future<Output = Result<T, ProviderError>>,
    {
        if self.providers.is_empty() {
            bail!("llm router has no providers configured");
        }

        let mut any_non_terminal_failed = false;
        let mut last_error: Option<ProviderError> = None;

        for provider in &self.providers {
            match self.attempt_provider(provider, &call).await {
                Ok(value) => {
                    return Ok(RouterOutcome {
                        value,
                        provider: provider.name().to_string(),
                        degraded: provider.is_terminal() && any_non_terminal_failed,
                    });
                }
                Err(err) => {
                    warn!(provider = provider.name(), error = %err, "provider failed call");
                    if !provider.is_terminal() {
                        any_non_terminal_failed = true;
                    }
                    last_error = Some(err);
                }
            }
        }

        Err(anyhow!(
            "all llm providers exhausted: {}",
            last_error.map(|e| e.to_string()).unwrap_or_default()
        ))
    }

    async fn attempt_provider<T, F, Fut>(
        &self,
        provider: &Arc<dyn LlmProvider>,
        call: &F,
    ) -> Result<T, ProviderError>
    where
        F: Fn(Arc<dyn LlmProvider>) -> Fut,
        Fut: std::future::Future<Output = Result<T, ProviderError>>,
    {
        for attempt in 0..=self.max_retries {
            // Permit scope covers the outbound call only.
            let _permit = self
                .semaphore
                .acquire()
                .await
                .map_err(|_| ProviderError::Transport("router shut down".to_string()))?;

            let result = timeout(self.call_timeout, call(Arc::clone(provider))).await;
            drop(_permit);

            match result {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(ProviderError::RateLimited(msg))) if attempt < self.max_retries => {
                    let delay = backoff_with_jitter(attempt);
                    debug!(
                        provider = provider.name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        detail = %msg,
                        "rate limited, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Ok(Err(err)) => return Err(err),
                Err(_) => return Err(ProviderError::Timeout(self.call_timeout.as_secs())),
            }
        }
        unreachable!("retry loop always returns");
    }
}

/// 200ms × 2^attempt with ±20% jitter.
fn backoff_with_jitter(attempt: u32) -> Duration {
    let base = BACKOFF_BASE_MS.saturating_mul(1 << attempt.min(16)) as f64;
    let factor = rand::thread_rng().gen_range(0.8..=1.2);
    Duration::from_millis((base * factor) as u64)
}

fn normalize_dim(mut vector: Vec<f32>) -> Vec<f32> {
    vector.truncate(REASONING_VECTOR_DIM);
    while vector.len() < REASONING_VECTOR_DIM {
        vector.push(0.0);
    }
    vector
}

/// Pull the first balanced JSON object or array out of a completion. Code
/// fences are stripped first; the candidate substring must parse strictly.
pub fn extract_json(raw: &str) -> Result<String, String> {
    let cleaned: String = raw
        .lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n");

    let bytes = cleaned.as_bytes();
    let start = cleaned
        .find(|c| c == '{' || c == '[')
        .ok_or_else(|| "no json object in completion".to_string())?;

    let open = bytes[start];
    let close = if open == b'{' { b'}' } else { b']' };

    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            _ if b == open => depth += 1,
            _ if b == close => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &cleaned[start..start + offset + 1];
                    return match serde_json::from_str::<serde_json::Value>(candidate) {
                        Ok(_) => Ok(candidate.to_string()),
                        Err(e) => Err(format!("candidate json did not parse: {e}")),
                    };
                }
            }
            _ => {}
        }
    }
    Err("unbalanced json in completion".to_string())
}
