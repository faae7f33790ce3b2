use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single fixed-interval OHLCV bar.
///
/// Candles are immutable once constructed; `Candle::new` rejects bars that
/// violate the OHLC ordering invariant (`low <= open,close <= high`) or carry
/// negative volume.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Result<Self> {
        if !(open.is_finite() && high.is_finite() && low.is_finite() && close.is_finite()) {
            bail!("candle at {timestamp} has non-finite prices");
        }
        if low > high {
            bail!("candle at {timestamp} has low {low} > high {high}");
        }
        if open < low || open > high || close < low || close > high {
            bail!("candle at {timestamp} has open/close outside [low, high]");
        }
        if !volume.is_finite() || volume < 0.0 {
            bail!("candle at {timestamp} has invalid volume {volume}");
        }
        Ok(Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        })
    }

    /// Intra-candle price range.
    pub fn range(&self) -> f64 {
        self.high - self.low
    }

    /// Midpoint of high and low.
    pub fn hl2(&self) -> f64 {
        (self.high + self.low) / 2.0
    }

    /// Typical price used by volume-flow indicators.
    pub fn typical_price(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }

    /// Whether `price` lies inside this candle's traded range.
    ///
    /// Used for path-aware pending-order fills: an order at exactly the low
    /// or the high counts as touched.
    pub fn brackets(&self, price: f64) -> bool {
        self.low <= price && price <= self.high
    }
}

/// 24-hour ticker snapshot returned by the market data gateway.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceTicker {
    pub price: f64,
    #[serde(rename = "high24h")]
    pub high_24h: f64,
    #[serde(rename = "low24h")]
    pub low_24h: f64,
    #[serde(rename = "volume24h")]
    pub volume_24h: f64,
    #[serde(rename = "change24h")]
    pub change_24h: f64,
    #[serde(rename = "changePct24h")]
    pub change_pct_24h: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_valid_candle() {
        let c = Candle::new(ts(), 100.0, 101.0, 99.0, 100.5, 1000.0).unwrap();
        assert_eq!(c.range(), 2.0);
        assert_eq!(c.hl2(), 100.0);
    }

    #[test]
    fn test_rejects_inverted_range() {
        assert!(Candle::new(ts(), 100.0, 99.0, 101.0, 100.0, 0.0).is_err());
    }

    #[test]
    fn test_rejects_close_outside_range() {
        assert!(Candle::new(ts(), 100.0, 101.0, 99.0, 102.0, 0.0).is_err());
    }

    #[test]
    fn test_rejects_negative_volume() {
        assert!(Candle::new(ts(), 100.0, 101.0, 99.0, 100.0, -1.0).is_err());
    }

    #[test]
    fn test_brackets_is_inclusive() {
        let c = Candle::new(ts(), 100.0, 100.2, 99.0, 100.0, 10.0).unwrap();
        assert!(c.brackets(99.0));
        assert!(c.brackets(100.2));
        assert!(c.brackets(99.5));
        assert!(!c.brackets(98.9));
        assert!(!c.brackets(100.3));
    }
}
