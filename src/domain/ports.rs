use crate::domain::agent::AgentConfig;
use crate::domain::decision::Decision;
use crate::domain::events::IndicatorMap;
use crate::domain::market::{Candle, PriceTicker, Timeframe};
use crate::domain::trading::Position;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Market data contract the engine consumes. Implementations own caching and
/// vendor failover; the engine only retries with exponential backoff over
/// whatever this interface throws.
#[async_trait]
pub trait MarketDataGateway: Send + Sync {
    /// Deterministic, inclusive candle range.
    async fn historical(
        &self,
        asset: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>>;

    /// Most recent fully closed candle, if any.
    async fn latest_closed(&self, asset: &str, timeframe: Timeframe) -> Result<Option<Candle>>;

    /// Current mark price with 24h statistics.
    async fn current_price(&self, asset: &str) -> Result<Option<PriceTicker>>;
}

/// Indicator snapshot for one candle of the recent-history window handed to
/// the decision model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentIndicators {
    pub candle_index: usize,
    pub values: IndicatorMap,
}

/// Everything the decision model sees for one candle.
#[derive(Debug, Clone)]
pub struct DecisionRequest {
    pub candle: Candle,
    pub indicators: IndicatorMap,
    pub position: Option<Position>,
    pub equity: f64,
    pub recent_candles: Vec<Candle>,
    pub recent_indicators: Vec<RecentIndicators>,
    /// Leverage policy, cadence metadata, and force-override diagnostics.
    pub context: serde_json::Value,
}

/// A source of trading decisions for one session.
///
/// `decide` must never fail: on unrecoverable trouble implementations return
/// a HOLD whose reasoning describes the problem. Callers rely on this.
#[async_trait]
pub trait DecisionProvider: Send + Sync {
    /// Optional pre-flight work (model metadata inspection). Called once
    /// during session initialization, before the first candle.
    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    async fn decide(&self, request: DecisionRequest) -> Decision;
}

/// Additional models deliberating alongside the agent's own model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouncilSpec {
    pub models: Vec<String>,
    pub chairman: Option<String>,
}

/// Builds the decision provider for a session once the agent config and the
/// decrypted credential are in hand. The runtime stays ignorant of whether it
/// talks to a single model, a council, or a scripted test double.
#[async_trait]
pub trait DecisionProviderFactory: Send + Sync {
    async fn create(
        &self,
        agent: &AgentConfig,
        api_key: String,
        council: Option<&CouncilSpec>,
    ) -> Result<Arc<dyn DecisionProvider>>;
}

/// Decrypts stored API credentials. The concrete cipher is a collaborator
/// outside this crate's scope; deployments plug in their KMS-backed
/// implementation.
pub trait ApiKeyCipher: Send + Sync {
    fn decrypt(&self, encrypted: &str) -> Result<String>;
}
