//! Single-model decision client: prompt building, chat-completion transport
//! with structured-output fallback, tolerant response decoding, and the full
//! resilience stack (throttle, timeout, retry, circuit breaker).

use crate::domain::agent::AgentMode;
use crate::domain::decision::{Decision, DecisionAction};
use crate::domain::errors::LlmError;
use crate::domain::ports::{DecisionProvider, DecisionRequest};
use crate::infrastructure::core::circuit_breaker::{CircuitBreaker, CircuitBreakerError};
use crate::infrastructure::core::retry::{parse_rate_limit_reset, retry_with_backoff};
use crate::infrastructure::core::throttle::throttle_request_start;
use crate::infrastructure::openrouter::LlmSettings;
use crate::infrastructure::openrouter::inspector::{ModelInspector, ModelMetadata};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::str::FromStr;
use tracing::{debug, error, info, warn};

pub struct OpenRouterTrader {
    http: reqwest::Client,
    api_key: String,
    model: String,
    strategy_prompt: String,
    mode: AgentMode,
    settings: LlmSettings,
    breaker: CircuitBreaker,
    inspector: ModelInspector,
    metadata: tokio::sync::OnceCell<ModelMetadata>,
}

impl OpenRouterTrader {
    pub fn new(
        api_key: String,
        model: String,
        strategy_prompt: String,
        mode: AgentMode,
        settings: LlmSettings,
    ) -> Self {
        let http = reqwest::Client::new();
        let inspector = ModelInspector::new(http.clone(), api_key.clone(), settings.base_url.clone());
        let breaker = CircuitBreaker::new(
            "openrouter",
            settings.breaker_failure_threshold,
            settings.breaker_reset_timeout,
        );
        info!(
            "OpenRouterTrader initialized: model={}, mode={}, strategy_length={}",
            model,
            mode,
            strategy_prompt.len()
        );
        Self {
            http,
            api_key,
            model,
            strategy_prompt,
            mode,
            settings,
            breaker,
            inspector,
            metadata: tokio::sync::OnceCell::new(),
        }
    }

    async fn metadata(&self) -> ModelMetadata {
        *self
            .metadata
            .get_or_init(|| self.inspector.inspect(&self.model))
            .await
    }

    /// One attempt: throttle the start, then run the transport under the
    /// breaker with a wall-clock bound, then decode.
    async fn single_attempt(
        &self,
        system: String,
        user: String,
        metadata: ModelMetadata,
        allow_leverage: bool,
    ) -> Result<Decision, LlmError> {
        throttle_request_start(self.settings.request_min_interval).await;

        let bounded = async {
            match tokio::time::timeout(
                self.settings.request_timeout,
                self.request_completion(&system, &user, metadata),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(LlmError::Timeout(self.settings.request_timeout)),
            }
        };

        let text = match self.breaker.call(bounded).await {
            Ok(text) => text,
            Err(CircuitBreakerError::Open(_)) => {
                return Err(LlmError::CircuitOpen {
                    service: "openrouter".to_string(),
                });
            }
            Err(CircuitBreakerError::Inner(e)) => return Err(e),
        };

        parse_decision(&text, allow_leverage)
    }

    async fn request_completion(
        &self,
        system: &str,
        user: &str,
        metadata: ModelMetadata,
    ) -> Result<String, LlmError> {
        // Strict schema first when the model advertises support; empty or
        // filtered responses fall back to plain JSON-object mode once.
        if metadata.supports_structured {
            match self.post_completion(system, user, metadata.max_tokens, true).await {
                Ok(content) if !content.trim().is_empty() => return Ok(content),
                Ok(_) => {
                    warn!(
                        "Empty response with structured outputs for model {}, retrying with json_object mode",
                        self.model
                    );
                }
                Err(LlmError::Api(message)) => {
                    warn!(
                        "Structured outputs failed for model {}, trying fallback: {}",
                        self.model, message
                    );
                }
                Err(other) => return Err(other),
            }
        }

        let content = self
            .post_completion(system, user, metadata.max_tokens, false)
            .await?;
        if content.trim().is_empty() {
            return Err(LlmError::Api(
                "Empty response from API even with json_object fallback".to_string(),
            ));
        }
        Ok(content)
    }

    async fn post_completion(
        &self,
        system: &str,
        user: &str,
        max_tokens: u32,
        structured: bool,
    ) -> Result<String, LlmError> {
        let response_format = if structured {
            json!({
                "type": "json_schema",
                "json_schema": {
                    "name": "trading_decision",
                    "strict": true,
                    "schema": decision_schema(),
                }
            })
        } else {
            json!({ "type": "json_object" })
        };

        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
            "response_format": response_format,
            "temperature": 0,
            "max_tokens": max_tokens,
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.settings.base_url))
            .bearer_auth(&self.api_key)
            .header("HTTP-Referer", &self.settings.http_referer)
            .header("X-Title", &self.settings.x_title)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 {
            let mut hint = None;
            for header in ["x-ratelimit-reset", "retry-after"] {
                if let Some(value) = response.headers().get(header).and_then(|v| v.to_str().ok()) {
                    hint = parse_rate_limit_reset(&format!("{}: {}", header, value));
                    if hint.is_some() {
                        break;
                    }
                }
            }
            let text = response.text().await.unwrap_or_default();
            let reset_at_ms = hint.or_else(|| parse_rate_limit_reset(&text));
            debug!("Rate limited by OpenRouter, reset hint: {:?}", reset_at_ms);
            return Err(LlmError::RateLimited { reset_at_ms });
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::Api(format!("HTTP {}: {}", status, truncate(&text, 300))));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| LlmError::Api(format!("unreadable response body: {e}")))?;

        let choice = payload
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .ok_or_else(|| LlmError::Api("No choices in API response".to_string()))?;
        let content = choice
            .pointer("/message/content")
            .and_then(Value::as_str)
            .unwrap_or_default();

        if content.trim().is_empty() {
            let finish_reason = choice
                .get("finish_reason")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            debug!(
                "Empty completion content: model={}, finish_reason={}",
                self.model, finish_reason
            );
            return Ok(String::new());
        }
        Ok(content.trim().to_string())
    }
}

#[async_trait]
impl DecisionProvider for OpenRouterTrader {
    async fn prepare(&self) -> anyhow::Result<()> {
        let metadata = self.metadata().await;
        debug!(
            "Model metadata ready: max_tokens={}, supports_structured={}",
            metadata.max_tokens, metadata.supports_structured
        );
        Ok(())
    }

    async fn decide(&self, request: DecisionRequest) -> Decision {
        let system = build_system_message(self.mode, &self.strategy_prompt);
        let user = build_user_message(&request);
        let allow_leverage = request
            .context
            .get("allow_leverage")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let metadata = self.metadata().await;

        let outcome = retry_with_backoff(self.settings.retry, "ai_decision", || {
            self.single_attempt(system.clone(), user.clone(), metadata, allow_leverage)
        })
        .await;

        match outcome {
            Ok(decision) => {
                info!(
                    "AI decision received: {} (size={}, leverage={})",
                    decision.action, decision.size_pct, decision.leverage
                );
                decision
            }
            Err(LlmError::CircuitOpen { .. }) => {
                // Expected degradation while the remote service is down, so
                // this logs at warning rather than error.
                warn!("AI decision skipped: circuit breaker open for model {}", self.model);
                Decision::hold("AI service temporarily unavailable (circuit breaker open)")
            }
            Err(e) => {
                error!("Error getting AI decision after retries: {}", e);
                Decision::hold(format!(
                    "Failed to get AI decision after {} attempts: {}",
                    self.settings.retry.max_attempts, e
                ))
            }
        }
    }
}

fn truncate(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// System message: the agent's mode and strategy, plus the output contract.
pub(crate) fn build_system_message(mode: AgentMode, strategy_prompt: &str) -> String {
    let mode_description = match mode {
        AgentMode::Monk => "Monk Mode (limited indicators)",
        AgentMode::Omni => "Omni Mode (all indicators)",
    };
    format!(
        "You are an AI trading agent operating in {mode_description}.\n\
         \n\
         Your Strategy:\n\
         {strategy_prompt}\n\
         \n\
         You must analyze the market data and make trading decisions based on your strategy.\n\
         Always respond with valid JSON in the exact format specified. Your response must be a JSON object with these fields:\n\
         - action: one of \"LONG\", \"SHORT\", \"CLOSE\", or \"HOLD\"\n\
         - reasoning: explanation for your decision\n\
         - size_percentage: number between 0.0 and 1.0 (fraction of capital to use)\n\
         - leverage: integer between 1 and 5\n\
         - entry_price: (optional) desired entry price\n\
         - stop_loss_price: (optional) stop loss price\n\
         - take_profit_price: (optional) take profit price"
    )
}

/// User message: compact JSON market snapshot plus a restatement of the
/// output schema and trading rules.
pub(crate) fn build_user_message(request: &DecisionRequest) -> String {
    let position_data = request.position.as_ref().map(|p| {
        json!({
            "action": p.side.to_string(),
            "entry_price": p.entry_price,
            "size": p.size,
            "stop_loss": p.stop_loss,
            "take_profit": p.take_profit,
            "leverage": p.leverage,
            "unrealized_pnl": p.unrealized_pnl,
        })
    });

    let market_context = json!({
        "candle": {
            "timestamp": request.candle.timestamp.to_rfc3339(),
            "open": request.candle.open,
            "high": request.candle.high,
            "low": request.candle.low,
            "close": request.candle.close,
            "volume": request.candle.volume,
        },
        "indicators": request.indicators,
        "position": position_data,
        "equity": request.equity,
        "recent_candles": request.recent_candles,
        "recent_indicators": request.recent_indicators,
        "decision_context": request.context,
    });

    let allow_leverage = request
        .context
        .get("allow_leverage")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let max_leverage = request
        .context
        .get("max_leverage")
        .and_then(Value::as_u64)
        .unwrap_or(1);
    let leverage_rule = if allow_leverage {
        format!("allowed up to {max_leverage}x")
    } else {
        "locked at 1x (no leverage allowed)".to_string()
    };

    format!(
        "Current Market State:\n\
         {context}\n\
         \n\
         Based on the current market state and your trading strategy, make a trading decision.\n\
         \n\
         You must respond with a valid JSON object in the following format:\n\
         {{\n\
         \x20   \"action\": \"LONG\" | \"SHORT\" | \"CLOSE\" | \"HOLD\",\n\
         \x20   \"reasoning\": \"Your detailed explanation for this decision\",\n\
         \x20   \"stop_loss_price\": <absolute price level for stop loss, optional>,\n\
         \x20   \"take_profit_price\": <absolute price level for take profit, optional>,\n\
         \x20   \"size_percentage\": <percentage of capital to use, 0.0 to 1.0>,\n\
         \x20   \"leverage\": <leverage multiplier, 1 to 5, default 1>\n\
         }}\n\
         \n\
         Rules:\n\
         - action: Must be one of LONG (buy), SHORT (sell), CLOSE (close position), or HOLD (do nothing)\n\
         - reasoning: Explain your decision based on indicators and market conditions\n\
         - stop_loss_price: Absolute price level (not percentage). For LONG, should be below entry. For SHORT, should be above entry.\n\
         - take_profit_price: Absolute price level (not percentage). For LONG, should be above entry. For SHORT, should be below entry.\n\
         - size_percentage: How much of your capital to use (0.0 to 1.0). For example, 0.5 means use 50% of capital.\n\
         - leverage: Multiplier for position size. Leverage is {leverage_rule}.\n\
         - If you have an open position, you can only CLOSE or HOLD\n\
         - If you don't have a position, you can LONG, SHORT, or HOLD",
        context = serde_json::to_string_pretty(&market_context).unwrap_or_default(),
    )
}

/// Strict JSON schema sent with structured-output requests.
pub fn decision_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "action": {
                "type": "string",
                "description": "Trading action to take",
                "enum": ["LONG", "SHORT", "CLOSE", "HOLD"],
            },
            "reasoning": {
                "type": "string",
                "description": "Explanation for the decision based on indicators and market context",
            },
            "entry_price": {
                "type": "number",
                "description": "Desired entry price. If omitted, enter at current close.",
            },
            "stop_loss_price": {
                "type": "number",
                "description": "Absolute stop loss price level. Optional; can be omitted.",
            },
            "take_profit_price": {
                "type": "number",
                "description": "Absolute take profit price level. Optional; can be omitted.",
            },
            "size_percentage": {
                "type": "number",
                "description": "Fraction of capital to use between 0.0 and 1.0",
                "minimum": 0.0,
                "maximum": 1.0,
            },
            "leverage": {
                "type": "integer",
                "description": "Leverage multiplier between 1 and 5",
                "minimum": 1,
                "maximum": 5,
            },
        },
        "required": ["action", "reasoning", "size_percentage", "leverage"],
        "additionalProperties": false,
    })
}

/// Decodes a model response into a `Decision`.
///
/// Models sometimes wrap the JSON in prose or markdown fences, so the
/// outermost `{...}` block is isolated first. Tolerances: null
/// `size_percentage` becomes 0.0, null leverage becomes 1, and an
/// integer-valued float leverage (2.0) is accepted as the integer. Anything
/// else out of contract is a parse error.
pub fn parse_decision(response_text: &str, allow_leverage: bool) -> Result<Decision, LlmError> {
    let stripped = response_text.trim();
    if stripped.is_empty() {
        return Err(LlmError::Parse("Empty response from API".to_string()));
    }

    let json_str = match (stripped.find('{'), stripped.rfind('}')) {
        (Some(start), Some(end)) if end > start => &stripped[start..=end],
        _ => stripped,
    };

    let data: Value = serde_json::from_str(json_str)
        .map_err(|e| LlmError::Parse(format!("Invalid JSON response: {e}")))?;

    let action_raw = data
        .get("action")
        .and_then(Value::as_str)
        .ok_or_else(|| LlmError::Parse("Missing 'action' field in response".to_string()))?;
    let action = DecisionAction::from_str(action_raw)
        .map_err(|_| LlmError::Parse(format!("Invalid action: {}", action_raw.to_uppercase())))?;

    let reasoning = data
        .get("reasoning")
        .and_then(Value::as_str)
        .ok_or_else(|| LlmError::Parse("Missing 'reasoning' field in response".to_string()))?
        .to_string();

    let size_pct = match data.get("size_percentage") {
        None | Some(Value::Null) => 0.0,
        Some(value) => value
            .as_f64()
            .ok_or_else(|| LlmError::Parse(format!("Invalid size_percentage: {value}")))?,
    };
    if !(0.0..=1.0).contains(&size_pct) {
        return Err(LlmError::Parse(format!(
            "size_percentage must be between 0.0 and 1.0, got {size_pct}"
        )));
    }

    let mut leverage = match data.get("leverage") {
        None | Some(Value::Null) => 1,
        Some(value) => {
            let raw = value
                .as_f64()
                .ok_or_else(|| LlmError::Parse(format!("Invalid leverage value: {value}")))?;
            if raw.fract() != 0.0 {
                return Err(LlmError::Parse(format!("Invalid leverage value: {raw}")));
            }
            raw as i64
        }
    };
    if !(1..=5).contains(&leverage) {
        return Err(LlmError::Parse(format!(
            "leverage must be between 1 and 5, got {leverage}"
        )));
    }
    if !allow_leverage {
        leverage = 1;
    }

    let optional_price = |key: &str| -> Result<Option<f64>, LlmError> {
        match data.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value
                .as_f64()
                .map(Some)
                .ok_or_else(|| LlmError::Parse(format!("Invalid {key} type: {value}"))),
        }
    };

    Ok(Decision {
        action,
        reasoning,
        entry_price: optional_price("entry_price")?,
        stop_loss_price: optional_price("stop_loss_price")?,
        take_profit_price: optional_price("take_profit_price")?,
        size_pct,
        leverage: leverage as u8,
        candle_index: None,
        context: None,
    })
}
