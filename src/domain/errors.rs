use std::time::Duration;
use thiserror::Error;

/// Errors raised while talking to the remote decision model.
///
/// The decision client never lets these escape `decide`; they drive the
/// retry/breaker stack and are ultimately folded into a diagnostic HOLD.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited (reset hint: {reset_at_ms:?} ms since epoch)")]
    RateLimited { reset_at_ms: Option<i64> },

    #[error("circuit breaker [{service}] is open")]
    CircuitOpen { service: String },

    #[error("unusable decision response: {0}")]
    Parse(String),

    #[error("API error: {0}")]
    Api(String),
}

impl LlmError {
    /// Whether the retry layer should attempt again. A rejected attempt from
    /// an open breaker is final for this decide call.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, LlmError::CircuitOpen { .. })
    }
}

/// Errors raised while building the indicator pipeline or evaluating custom
/// indicator rules.
#[derive(Debug, Error)]
pub enum IndicatorError {
    #[error("unknown indicators: {0:?}")]
    UnknownIndicators(Vec<String>),

    #[error("mode '{mode}' only allows {allowed:?}; restricted: {restricted:?}")]
    ModeRestricted {
        mode: String,
        allowed: Vec<String>,
        restricted: Vec<String>,
    },

    #[error("[{code}] {message} (rule: {rule})")]
    InvalidRule {
        code: &'static str,
        message: String,
        rule: String,
    },

    #[error("circular dependency detected: {0}")]
    CircularDependency(String),

    #[error("candle index {index} out of range for {len} candles")]
    IndexOutOfRange { index: usize, len: usize },
}

impl IndicatorError {
    pub fn invalid_rule(code: &'static str, message: impl Into<String>, rule: impl Into<String>) -> Self {
        IndicatorError::InvalidRule {
            code,
            message: message.into(),
            rule: rule.into(),
        }
    }
}

/// Errors surfaced at the engine's public entry points.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("market data error: {0}")]
    MarketData(String),
}
