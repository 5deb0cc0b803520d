//! Environment-driven configuration.
//!
//! Providers form the router chain in order: primary (cloud), then
//! secondary (typically a local inference box), then always the built-in
//! deterministic fallback. A provider with no base URL configured is simply
//! absent from the chain.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::router::{
    HttpProvider, HttpProviderConfig, LlmProvider, LlmRouter, RouterConfig,
    DEFAULT_MAX_CONCURRENT_CALLS, DEFAULT_MAX_RETRIES,
};
use crate::supervisor::SupervisorConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub providers: Vec<HttpProviderConfig>,
    pub max_retries: u32,
    pub call_timeout_secs: u64,
    pub max_concurrent_calls: usize,
    pub stage_timeout_secs: u64,
    pub guard_timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let mut providers = Vec::new();
        for (prefix, default_name) in [("RECONBOT_PRIMARY", "cloud"), ("RECONBOT_SECONDARY", "local")]
        {
            let base_url = env::var(format!("{prefix}_BASE_URL")).unwrap_or_default();
            if base_url.trim().is_empty() {
                continue;
            }
            providers.push(HttpProviderConfig {
                name: env::var(format!("{prefix}_NAME"))
                    .unwrap_or_else(|_| default_name.to_string()),
                base_url,
                api_key: env::var(format!("{prefix}_API_KEY")).unwrap_or_default(),
                model: env::var(format!("{prefix}_MODEL"))
                    .unwrap_or_else(|_| "openai/gpt-4o-mini".to_string()),
                embed_model: env::var(format!("{prefix}_EMBED_MODEL"))
                    .unwrap_or_else(|_| "openai/text-embedding-3-small".to_string()),
            });
        }

        let max_retries = env::var("LLM_MAX_RETRIES")
            .unwrap_or_else(|_| DEFAULT_MAX_RETRIES.to_string())
            .parse()
            .unwrap_or(DEFAULT_MAX_RETRIES);

        let call_timeout_secs = env::var("LLM_CALL_TIMEOUT_SECS")
            .unwrap_or_else(|_| "60".to_string())
            .parse()
            .unwrap_or(60);

        let max_concurrent_calls = env::var("LLM_MAX_CONCURRENT_CALLS")
            .unwrap_or_else(|_| DEFAULT_MAX_CONCURRENT_CALLS.to_string())
            .parse()
            .unwrap_or(DEFAULT_MAX_CONCURRENT_CALLS);

        let stage_timeout_secs = env::var("STAGE_TIMEOUT_SECS")
            .unwrap_or_else(|_| "60".to_string())
            .parse()
            .unwrap_or(60);

        let guard_timeout_secs = env::var("GUARD_TIMEOUT_SECS")
            .unwrap_or_else(|_| "120".to_string())
            .parse()
            .unwrap_or(120);

        Ok(Self {
            providers,
            max_retries,
            call_timeout_secs,
            max_concurrent_calls,
            stage_timeout_secs,
            guard_timeout_secs,
        })
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            max_retries: self.max_retries,
            call_timeout: Duration::from_secs(self.call_timeout_secs),
            max_concurrent_calls: self.max_concurrent_calls,
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            stage_timeout: Duration::from_secs(self.stage_timeout_secs),
            guard_timeout: Duration::from_secs(self.guard_timeout_secs),
        }
    }

    /// The configured HTTP chain terminated by the deterministic provider.
    pub fn build_router(&self) -> Result<LlmRouter> {
        let mut chain: Vec<Arc<dyn LlmProvider>> = Vec::new();
        for provider in &self.providers {
            chain.push(Arc::new(HttpProvider::new(provider.clone())?));
        }
        Ok(LlmRouter::with_deterministic_tail(
            chain,
            self.router_config(),
        ))
    }
}
