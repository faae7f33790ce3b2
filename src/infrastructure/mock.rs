//! Test doubles for the engine's ports: a scripted decision provider and a
//! synthetic market-data gateway. Used by integration tests and local dry
//! runs; nothing here touches the network.

use crate::domain::agent::AgentConfig;
use crate::domain::decision::Decision;
use crate::domain::market::{Candle, PriceTicker, Timeframe};
use crate::domain::ports::{
    CouncilSpec, DecisionProvider, DecisionProviderFactory, DecisionRequest, MarketDataGateway,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

/// Returns decisions from a script, falling back to a default once the
/// script runs dry. Records every request it saw.
pub struct ScriptedDecisionProvider {
    script: Mutex<VecDeque<Decision>>,
    default: Decision,
    calls: AtomicUsize,
    requests: Mutex<Vec<DecisionRequest>>,
}

impl ScriptedDecisionProvider {
    pub fn new(script: Vec<Decision>, default: Decision) -> Self {
        Self {
            script: Mutex::new(script.into()),
            default,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn always(decision: Decision) -> Self {
        Self::new(Vec::new(), decision)
    }

    pub fn always_hold() -> Self {
        Self::always(Decision::hold("scripted hold"))
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn recorded_requests(&self) -> Vec<DecisionRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl DecisionProvider for ScriptedDecisionProvider {
    async fn decide(&self, request: DecisionRequest) -> Decision {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().await.push(request);
        self.script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| self.default.clone())
    }
}

/// Factory handing the same scripted provider to every session.
pub struct ScriptedProviderFactory {
    provider: Arc<ScriptedDecisionProvider>,
}

impl ScriptedProviderFactory {
    pub fn new(provider: Arc<ScriptedDecisionProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl DecisionProviderFactory for ScriptedProviderFactory {
    async fn create(
        &self,
        _agent: &AgentConfig,
        _api_key: String,
        _council: Option<&CouncilSpec>,
    ) -> Result<Arc<dyn DecisionProvider>> {
        Ok(self.provider.clone())
    }
}

/// In-memory market data with injectable historical series and a queue of
/// "live" candles served one per `latest_closed` call.
pub struct SyntheticMarketData {
    historical: Mutex<HashMap<(String, Timeframe), Vec<Candle>>>,
    live: Mutex<VecDeque<Candle>>,
    ticker: Mutex<Option<PriceTicker>>,
}

impl SyntheticMarketData {
    pub fn new() -> Self {
        Self {
            historical: Mutex::new(HashMap::new()),
            live: Mutex::new(VecDeque::new()),
            ticker: Mutex::new(None),
        }
    }

    pub async fn set_historical(&self, asset: &str, timeframe: Timeframe, candles: Vec<Candle>) {
        self.historical
            .lock()
            .await
            .insert((asset.to_string(), timeframe), candles);
    }

    pub async fn push_live(&self, candle: Candle) {
        self.live.lock().await.push_back(candle);
    }

    pub async fn set_ticker(&self, ticker: PriceTicker) {
        *self.ticker.lock().await = Some(ticker);
    }
}

impl Default for SyntheticMarketData {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MarketDataGateway for SyntheticMarketData {
    async fn historical(
        &self,
        asset: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        let store = self.historical.lock().await;
        Ok(store
            .get(&(asset.to_string(), timeframe))
            .map(|candles| {
                candles
                    .iter()
                    .filter(|c| c.timestamp >= start && c.timestamp <= end)
                    .copied()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn latest_closed(&self, _asset: &str, _timeframe: Timeframe) -> Result<Option<Candle>> {
        Ok(self.live.lock().await.pop_front())
    }

    async fn current_price(&self, _asset: &str) -> Result<Option<PriceTicker>> {
        Ok(*self.ticker.lock().await)
    }
}

/// Flat-price candle series for deterministic scenarios.
pub fn flat_series(
    count: usize,
    price: f64,
    start: DateTime<Utc>,
    timeframe: Timeframe,
) -> Vec<Candle> {
    (0..count)
        .map(|i| {
            Candle::new(
                start + Duration::seconds(timeframe.to_seconds() * i as i64),
                price,
                price + 0.5,
                price - 0.5,
                price,
                1000.0,
            )
            .unwrap()
        })
        .collect()
}

/// Convenient deterministic series start.
pub fn series_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::decision::DecisionAction;

    #[tokio::test]
    async fn test_scripted_provider_plays_script_then_default() {
        let mut long = Decision::hold("x");
        long.action = DecisionAction::Long;
        long.size_pct = 0.5;

        let provider = ScriptedDecisionProvider::new(vec![long], Decision::hold("default"));

        let request = DecisionRequest {
            candle: flat_series(1, 100.0, series_start(), Timeframe::OneHour)[0],
            indicators: Default::default(),
            position: None,
            equity: 10_000.0,
            recent_candles: vec![],
            recent_indicators: vec![],
            context: serde_json::Value::Null,
        };

        let first = provider.decide(request.clone()).await;
        assert_eq!(first.action, DecisionAction::Long);
        let second = provider.decide(request).await;
        assert_eq!(second.action, DecisionAction::Hold);
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn test_synthetic_historical_range_filter() {
        let gateway = SyntheticMarketData::new();
        let candles = flat_series(10, 100.0, series_start(), Timeframe::OneHour);
        gateway
            .set_historical("BTC/USDT", Timeframe::OneHour, candles.clone())
            .await;

        let subset = gateway
            .historical(
                "BTC/USDT",
                Timeframe::OneHour,
                candles[2].timestamp,
                candles[5].timestamp,
            )
            .await
            .unwrap();
        assert_eq!(subset.len(), 4);
    }

    #[tokio::test]
    async fn test_live_queue_serves_in_order() {
        let gateway = SyntheticMarketData::new();
        let candles = flat_series(2, 100.0, series_start(), Timeframe::OneHour);
        gateway.push_live(candles[0]).await;
        gateway.push_live(candles[1]).await;

        let first = gateway.latest_closed("BTC/USDT", Timeframe::OneHour).await.unwrap();
        assert_eq!(first.unwrap().timestamp, candles[0].timestamp);
        let second = gateway.latest_closed("BTC/USDT", Timeframe::OneHour).await.unwrap();
        assert_eq!(second.unwrap().timestamp, candles[1].timestamp);
        assert!(
            gateway
                .latest_closed("BTC/USDT", Timeframe::OneHour)
                .await
                .unwrap()
                .is_none()
        );
    }
}
