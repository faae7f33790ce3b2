//! Binance public-REST implementation of the market data gateway.
//!
//! Only public market data is consumed (klines and 24h tickers); transient
//! failures are handled by the retrying HTTP client, and the session
//! runtimes add their own backoff on top of whatever this surface throws.

use crate::domain::market::{Candle, PriceTicker, Timeframe};
use crate::domain::ports::MarketDataGateway;
use crate::infrastructure::core::http_client_factory::{HttpClientFactory, build_url_with_query};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest_middleware::ClientWithMiddleware;
use serde_json::Value;
use tracing::{debug, info};

/// Supported assets and their exchange symbols.
pub const ASSET_SYMBOL_MAP: &[(&str, &str)] = &[
    ("BTC/USDT", "BTCUSDT"),
    ("ETH/USDT", "ETHUSDT"),
    ("SOL/USDT", "SOLUSDT"),
    ("BNB/USDT", "BNBUSDT"),
];

pub fn exchange_symbol(asset: &str) -> Option<&'static str> {
    ASSET_SYMBOL_MAP
        .iter()
        .find(|(name, _)| *name == asset)
        .map(|(_, symbol)| *symbol)
}

pub fn supported_assets() -> Vec<&'static str> {
    ASSET_SYMBOL_MAP.iter().map(|(name, _)| *name).collect()
}

const KLINES_PAGE_LIMIT: usize = 1000;

pub struct BinanceMarketDataGateway {
    client: ClientWithMiddleware,
    base_url: String,
}

impl BinanceMarketDataGateway {
    pub fn builder() -> BinanceMarketDataGatewayBuilder {
        BinanceMarketDataGatewayBuilder::default()
    }

    fn parse_kline(entry: &Value) -> Result<Candle> {
        let fields = entry
            .as_array()
            .ok_or_else(|| anyhow!("kline entry is not an array"))?;
        if fields.len() < 6 {
            return Err(anyhow!("kline entry too short: {} fields", fields.len()));
        }

        let open_time = fields[0]
            .as_i64()
            .ok_or_else(|| anyhow!("kline open time missing"))?;
        let number = |i: usize| -> Result<f64> {
            fields[i]
                .as_str()
                .and_then(|s| s.parse::<f64>().ok())
                .or_else(|| fields[i].as_f64())
                .ok_or_else(|| anyhow!("kline field {} is not numeric", i))
        };

        Candle::new(
            Utc.timestamp_millis_opt(open_time)
                .single()
                .ok_or_else(|| anyhow!("kline open time out of range: {open_time}"))?,
            number(1)?,
            number(2)?,
            number(3)?,
            number(4)?,
            number(5)?,
        )
    }

    async fn fetch_klines(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        let mut params: Vec<(String, String)> = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("interval".to_string(), timeframe.as_str().to_string()),
            ("limit".to_string(), limit.to_string()),
        ];
        if let Some(start) = start_ms {
            params.push(("startTime".to_string(), start.to_string()));
        }
        if let Some(end) = end_ms {
            params.push(("endTime".to_string(), end.to_string()));
        }

        let url = build_url_with_query(&format!("{}/api/v3/klines", self.base_url), &params);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to fetch klines")?;
        let payload: Value = response
            .error_for_status()
            .context("Klines request rejected")?
            .json()
            .await
            .context("Unreadable klines payload")?;

        let entries = payload
            .as_array()
            .ok_or_else(|| anyhow!("klines payload is not an array"))?;
        entries.iter().map(Self::parse_kline).collect()
    }
}

#[derive(Default)]
pub struct BinanceMarketDataGatewayBuilder {
    base_url: Option<String>,
}

impl BinanceMarketDataGatewayBuilder {
    pub fn base_url(mut self, base_url: String) -> Self {
        self.base_url = Some(base_url);
        self
    }

    pub fn build(self) -> BinanceMarketDataGateway {
        BinanceMarketDataGateway {
            client: HttpClientFactory::create_client(),
            base_url: self
                .base_url
                .unwrap_or_else(|| "https://api.binance.com".to_string()),
        }
    }
}

#[async_trait]
impl MarketDataGateway for BinanceMarketDataGateway {
    async fn historical(
        &self,
        asset: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        let symbol = exchange_symbol(asset)
            .ok_or_else(|| anyhow!("Unsupported asset '{asset}'"))?;

        let mut candles: Vec<Candle> = Vec::new();
        let mut cursor = start.timestamp_millis();
        let end_ms = end.timestamp_millis();

        // Page through the range; the API caps each response at 1000 bars.
        loop {
            let page = self
                .fetch_klines(symbol, timeframe, Some(cursor), Some(end_ms), KLINES_PAGE_LIMIT)
                .await?;
            if page.is_empty() {
                break;
            }
            let page_len = page.len();
            let last_ts = page.last().unwrap().timestamp;
            candles.extend(page);
            if page_len < KLINES_PAGE_LIMIT {
                break;
            }
            cursor = last_ts.timestamp_millis() + timeframe.to_seconds() * 1000;
            if cursor > end_ms {
                break;
            }
        }

        info!(
            "Fetched {} candles for {} {} ({} - {})",
            candles.len(),
            asset,
            timeframe,
            start,
            end
        );
        Ok(candles)
    }

    async fn latest_closed(&self, asset: &str, timeframe: Timeframe) -> Result<Option<Candle>> {
        let symbol = exchange_symbol(asset)
            .ok_or_else(|| anyhow!("Unsupported asset '{asset}'"))?;

        // The final kline of the page is still forming; the one before it is
        // the last closed candle.
        let page = self.fetch_klines(symbol, timeframe, None, None, 2).await?;
        let closed = if page.len() >= 2 {
            page.get(page.len() - 2).copied()
        } else {
            None
        };
        debug!(
            "Latest closed candle for {} {}: {:?}",
            asset,
            timeframe,
            closed.map(|c| c.timestamp)
        );
        Ok(closed)
    }

    async fn current_price(&self, asset: &str) -> Result<Option<PriceTicker>> {
        let symbol = exchange_symbol(asset)
            .ok_or_else(|| anyhow!("Unsupported asset '{asset}'"))?;

        let url = build_url_with_query(
            &format!("{}/api/v3/ticker/24hr", self.base_url),
            &[("symbol", symbol)],
        );
        let payload: Value = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to fetch 24h ticker")?
            .error_for_status()
            .context("Ticker request rejected")?
            .json()
            .await
            .context("Unreadable ticker payload")?;

        let field = |key: &str| -> Option<f64> {
            payload
                .get(key)
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<f64>().ok())
        };

        let Some(price) = field("lastPrice") else {
            return Ok(None);
        };
        Ok(Some(PriceTicker {
            price,
            high_24h: field("highPrice").unwrap_or(price),
            low_24h: field("lowPrice").unwrap_or(price),
            volume_24h: field("volume").unwrap_or(0.0),
            change_24h: field("priceChange").unwrap_or(0.0),
            change_pct_24h: field("priceChangePercent").unwrap_or(0.0),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_exchange_symbol_lookup() {
        assert_eq!(exchange_symbol("BTC/USDT"), Some("BTCUSDT"));
        assert_eq!(exchange_symbol("DOGE/USDT"), None);
    }

    #[test]
    fn test_parse_kline() {
        let entry = json!([
            1704067200000i64,
            "42000.1",
            "42500.0",
            "41900.5",
            "42250.3",
            "123.456",
            1704070799999i64
        ]);
        let candle = BinanceMarketDataGateway::parse_kline(&entry).unwrap();
        assert_eq!(candle.open, 42000.1);
        assert_eq!(candle.high, 42500.0);
        assert_eq!(candle.low, 41900.5);
        assert_eq!(candle.close, 42250.3);
        assert_eq!(candle.volume, 123.456);
        assert_eq!(candle.timestamp.timestamp_millis(), 1704067200000);
    }

    #[test]
    fn test_parse_kline_rejects_garbage() {
        assert!(BinanceMarketDataGateway::parse_kline(&json!({"not": "array"})).is_err());
        assert!(BinanceMarketDataGateway::parse_kline(&json!([1, 2])).is_err());
    }
}
