//! OpenRouter-backed decision providers: the single-model trader and the
//! multi-model council, sharing one transport and parsing layer.

pub mod client;
pub mod council;
pub mod inspector;

use crate::domain::agent::AgentConfig;
use crate::domain::ports::{CouncilSpec, DecisionProvider, DecisionProviderFactory};
use crate::infrastructure::core::retry::RetryPolicy;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub use client::OpenRouterTrader;
pub use council::CouncilTrader;

/// Additional council members used when the caller enables council mode
/// without naming extra models. The agent's own model always leads.
const DEFAULT_COUNCIL_MODELS: &[&str] = &["openai/gpt-4o-mini", "google/gemini-flash-1.5"];

/// Transport and resilience knobs shared by every OpenRouter call.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub base_url: String,
    pub http_referer: String,
    pub x_title: String,
    /// Minimum gap between consecutive request starts, process-wide.
    pub request_min_interval: Duration,
    /// Wall-clock bound per attempt.
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    pub breaker_failure_threshold: usize,
    pub breaker_reset_timeout: Duration,
    /// Per-model timeout inside council stages.
    pub council_model_timeout: Duration,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            base_url: "https://openrouter.ai/api/v1".to_string(),
            http_referer: "http://localhost:3000".to_string(),
            x_title: "Candlemind".to_string(),
            request_min_interval: Duration::from_millis(500),
            request_timeout: Duration::from_secs(45),
            retry: RetryPolicy::default(),
            breaker_failure_threshold: 5,
            breaker_reset_timeout: Duration::from_secs(60),
            council_model_timeout: Duration::from_secs(30),
        }
    }
}

/// Builds OpenRouter-backed providers for sessions.
pub struct OpenRouterProviderFactory {
    settings: LlmSettings,
}

impl OpenRouterProviderFactory {
    pub fn new(settings: LlmSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl DecisionProviderFactory for OpenRouterProviderFactory {
    async fn create(
        &self,
        agent: &AgentConfig,
        api_key: String,
        council: Option<&CouncilSpec>,
    ) -> Result<Arc<dyn DecisionProvider>> {
        match council {
            Some(spec) => {
                let additional: Vec<String> = if spec.models.is_empty() {
                    DEFAULT_COUNCIL_MODELS.iter().map(|s| s.to_string()).collect()
                } else {
                    spec.models.clone()
                };

                // The agent's model is always the first council member and
                // the default chairman.
                let mut members = vec![agent.model.clone()];
                members.extend(additional);
                let chairman = spec.chairman.clone().unwrap_or_else(|| agent.model.clone());

                Ok(Arc::new(CouncilTrader::new(
                    api_key,
                    members,
                    chairman,
                    agent.strategy_prompt.clone(),
                    agent.mode,
                    self.settings.clone(),
                )))
            }
            None => Ok(Arc::new(OpenRouterTrader::new(
                api_key,
                agent.model.clone(),
                agent.strategy_prompt.clone(),
                agent.mode,
                self.settings.clone(),
            ))),
        }
    }
}
