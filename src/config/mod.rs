//! Environment-driven engine configuration.

use crate::infrastructure::core::retry::RetryPolicy;
use crate::infrastructure::openrouter::LlmSettings;
use anyhow::Result;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    pub market_data_base_url: String,
    pub openrouter_base_url: String,
    pub http_referer: String,
    pub x_title: String,
    /// Minimum gap between consecutive LLM request starts, process-wide.
    pub api_request_delay_ms: u64,
    pub ai_decision_timeout_secs: u64,
    pub max_retries: usize,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_secs: u64,
    pub circuit_breaker_failure_threshold: usize,
    pub circuit_breaker_timeout_secs: u64,
    pub heartbeat_max_age_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: env_or("DATABASE_URL", "sqlite://data/candlemind.db"),
            bind_addr: env_or("BIND_ADDR", "127.0.0.1:8090"),
            market_data_base_url: env_or("MARKET_DATA_BASE_URL", "https://api.binance.com"),
            openrouter_base_url: env_or("OPENROUTER_BASE_URL", "https://openrouter.ai/api/v1"),
            http_referer: env_or("OPENROUTER_HTTP_REFERER", "http://localhost:3000"),
            x_title: env_or("OPENROUTER_X_TITLE", "Candlemind"),
            api_request_delay_ms: env_parse("API_REQUEST_DELAY_MS", 500),
            ai_decision_timeout_secs: env_parse("AI_DECISION_TIMEOUT_SECS", 45),
            max_retries: env_parse("MAX_RETRIES", 3),
            retry_base_delay_ms: env_parse("RETRY_BASE_DELAY_MS", 1000),
            retry_max_delay_secs: env_parse("RETRY_MAX_DELAY_SECS", 30),
            circuit_breaker_failure_threshold: env_parse("CIRCUIT_BREAKER_FAILURE_THRESHOLD", 5),
            circuit_breaker_timeout_secs: env_parse("CIRCUIT_BREAKER_TIMEOUT_SECS", 60),
            heartbeat_max_age_secs: env_parse("HEARTBEAT_MAX_AGE_SECS", 300),
        })
    }

    pub fn llm_settings(&self) -> LlmSettings {
        LlmSettings {
            base_url: self.openrouter_base_url.clone(),
            http_referer: self.http_referer.clone(),
            x_title: self.x_title.clone(),
            request_min_interval: Duration::from_millis(self.api_request_delay_ms),
            request_timeout: Duration::from_secs(self.ai_decision_timeout_secs),
            retry: RetryPolicy {
                max_attempts: self.max_retries.max(1),
                base_delay: Duration::from_millis(self.retry_base_delay_ms),
                max_delay: Duration::from_secs(self.retry_max_delay_secs),
            },
            breaker_failure_threshold: self.circuit_breaker_failure_threshold,
            breaker_reset_timeout: Duration::from_secs(self.circuit_breaker_timeout_secs),
            council_model_timeout: Duration::from_secs(30),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}
