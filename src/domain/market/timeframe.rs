use anyhow::{Result, anyhow};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Represents the candle intervals supported by the simulation engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    FifteenMin,
    OneHour,
    FourHour,
    OneDay,
}

impl Timeframe {
    /// Returns the duration of this timeframe in minutes.
    pub fn to_minutes(&self) -> i64 {
        match self {
            Timeframe::FifteenMin => 15,
            Timeframe::OneHour => 60,
            Timeframe::FourHour => 240,
            Timeframe::OneDay => 1440,
        }
    }

    /// Returns the duration in seconds.
    pub fn to_seconds(&self) -> i64 {
        self.to_minutes() * 60
    }

    /// Canonical short string, which is also the Binance interval string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::FifteenMin => "15m",
            Timeframe::OneHour => "1h",
            Timeframe::FourHour => "4h",
            Timeframe::OneDay => "1d",
        }
    }

    /// Returns all supported timeframes in ascending order.
    pub fn all() -> Vec<Timeframe> {
        vec![
            Timeframe::FifteenMin,
            Timeframe::OneHour,
            Timeframe::FourHour,
            Timeframe::OneDay,
        ]
    }

    /// Start of the period containing `at`, aligned to this timeframe.
    pub fn period_start(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let secs = at.timestamp();
        let period = self.to_seconds();
        Utc.timestamp_opt(secs - secs.rem_euclid(period), 0)
            .single()
            .unwrap_or(at)
    }

    /// The next candle-close boundary strictly after `at`.
    ///
    /// If `at` sits exactly on a boundary the following boundary is returned,
    /// matching the forward runtime's wait semantics.
    pub fn next_close_after(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        self.period_start(at) + ChronoDuration::seconds(self.to_seconds())
    }

    /// Bounds applied to the forward warm-up window for this timeframe:
    /// `(min_candles, max_candles, multiplier)`.
    pub fn warmup_bounds(&self) -> (usize, usize, f64) {
        match self {
            Timeframe::FifteenMin => (250, 1000, 1.0),
            Timeframe::OneHour => (300, 1000, 1.2),
            Timeframe::FourHour => (300, 1000, 1.3),
            Timeframe::OneDay => (400, 1000, 1.5),
        }
    }

    /// Number of warm-up candles to fetch given the largest enabled indicator
    /// lookback: lookback * 1.5, scaled and clamped per timeframe.
    pub fn warmup_candles(&self, max_lookback: usize) -> usize {
        let lookback = if max_lookback == 0 { 200 } else { max_lookback };
        let (min, max, multiplier) = self.warmup_bounds();
        let required = (lookback as f64 * 1.5 * multiplier) as usize;
        required.clamp(min, max)
    }
}

impl FromStr for Timeframe {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "15m" | "15min" => Ok(Timeframe::FifteenMin),
            "1h" | "1hour" | "60m" => Ok(Timeframe::OneHour),
            "4h" | "4hour" => Ok(Timeframe::FourHour),
            "1d" | "1day" => Ok(Timeframe::OneDay),
            _ => Err(anyhow!(
                "Invalid timeframe: '{}'. Valid options: 15m, 1h, 4h, 1d",
                s
            )),
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Delay applied after each LLM-call candle during backtest playback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackSpeed {
    Slow,
    Normal,
    Fast,
    Instant,
}

impl PlaybackSpeed {
    pub fn delay_ms(&self) -> u64 {
        match self {
            PlaybackSpeed::Slow => 1000,
            PlaybackSpeed::Normal => 500,
            PlaybackSpeed::Fast => 200,
            PlaybackSpeed::Instant => 0,
        }
    }
}

impl FromStr for PlaybackSpeed {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "slow" => Ok(PlaybackSpeed::Slow),
            "normal" => Ok(PlaybackSpeed::Normal),
            "fast" => Ok(PlaybackSpeed::Fast),
            "instant" => Ok(PlaybackSpeed::Instant),
            _ => Err(anyhow!(
                "Invalid playback speed: '{}'. Valid options: slow, normal, fast, instant",
                s
            )),
        }
    }
}

impl fmt::Display for PlaybackSpeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PlaybackSpeed::Slow => "slow",
            PlaybackSpeed::Normal => "normal",
            PlaybackSpeed::Fast => "fast",
            PlaybackSpeed::Instant => "instant",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_minutes() {
        assert_eq!(Timeframe::FifteenMin.to_minutes(), 15);
        assert_eq!(Timeframe::OneHour.to_minutes(), 60);
        assert_eq!(Timeframe::FourHour.to_minutes(), 240);
        assert_eq!(Timeframe::OneDay.to_minutes(), 1440);
    }

    #[test]
    fn test_from_str() {
        assert_eq!(Timeframe::from_str("15m").unwrap(), Timeframe::FifteenMin);
        assert_eq!(Timeframe::from_str("1H").unwrap(), Timeframe::OneHour);
        assert_eq!(Timeframe::from_str("4h").unwrap(), Timeframe::FourHour);
        assert_eq!(Timeframe::from_str("1d").unwrap(), Timeframe::OneDay);
        assert!(Timeframe::from_str("5m").is_err());
    }

    #[test]
    fn test_period_start_alignment() {
        let tf = Timeframe::FifteenMin;
        // 2024-01-01 00:07:00 UTC falls inside the 00:00 period
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 7, 0).unwrap();
        assert_eq!(
            tf.period_start(at),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_next_close_after() {
        let tf = Timeframe::OneHour;
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 10, 23, 11).unwrap();
        assert_eq!(
            tf.next_close_after(at),
            Utc.with_ymd_and_hms(2024, 1, 1, 11, 0, 0).unwrap()
        );

        // Exactly on the boundary moves to the following boundary.
        let boundary = Utc.with_ymd_and_hms(2024, 1, 1, 11, 0, 0).unwrap();
        assert_eq!(
            tf.next_close_after(boundary),
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_warmup_candles_clamped() {
        // SMA-200 on 15m: 200 * 1.5 = 300, within [250, 1000]
        assert_eq!(Timeframe::FifteenMin.warmup_candles(200), 300);
        // Small lookback clamps up to the timeframe minimum
        assert_eq!(Timeframe::FifteenMin.warmup_candles(14), 250);
        // Zero lookback falls back to the SMA-200 default
        assert_eq!(Timeframe::OneDay.warmup_candles(0), 450);
    }

    #[test]
    fn test_playback_delays() {
        assert_eq!(PlaybackSpeed::Slow.delay_ms(), 1000);
        assert_eq!(PlaybackSpeed::Normal.delay_ms(), 500);
        assert_eq!(PlaybackSpeed::Fast.delay_ms(), 200);
        assert_eq!(PlaybackSpeed::Instant.delay_ms(), 0);
    }
}
