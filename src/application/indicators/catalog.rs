//! Standard indicator catalog: names, lookback table, and whole-series
//! computation over a candle slice.
//!
//! Series are computed once at pipeline construction. Streaming `ta`
//! indicators emit values from the very first sample, so each series is
//! masked to NaN before its minimum history is available; NaN surfaces as
//! `null` at the pipeline boundary and drives the readiness queries.

use crate::domain::market::Candle;
use ta::indicators::{
    AverageTrueRange, BollingerBands, CommodityChannelIndex, ExponentialMovingAverage,
    FastStochastic, KeltnerChannel, Maximum, Minimum, MoneyFlowIndex,
    MovingAverageConvergenceDivergence, OnBalanceVolume, RateOfChange, RelativeStrengthIndex,
    SimpleMovingAverage, StandardDeviation,
};
use ta::{DataItem, Next};

pub const MOMENTUM_INDICATORS: &[&str] = &["rsi", "stoch", "cci", "mom", "ao"];
pub const TREND_INDICATORS: &[&str] = &[
    "macd", "ema_20", "ema_50", "ema_200", "sma_20", "sma_50", "sma_200", "adx", "psar",
];
pub const VOLATILITY_INDICATORS: &[&str] = &["bbands", "atr", "kc", "donchian"];
pub const VOLUME_INDICATORS: &[&str] = &["obv", "vwap", "mfi", "cmf", "ad_line"];
pub const ADVANCED_INDICATORS: &[&str] = &["supertrend", "ichimoku", "zscore"];

/// Indicators admissible in monk mode.
pub const MONK_MODE_INDICATORS: &[&str] = &["rsi", "macd"];

pub fn is_known(name: &str) -> bool {
    MOMENTUM_INDICATORS
        .iter()
        .chain(TREND_INDICATORS)
        .chain(VOLATILITY_INDICATORS)
        .chain(VOLUME_INDICATORS)
        .chain(ADVANCED_INDICATORS)
        .any(|n| *n == name)
}

/// Expands user-facing aliases into canonical names, lowercasing, trimming,
/// and de-duplicating while preserving order.
pub fn expand_aliases(names: &[String]) -> Vec<String> {
    let mut expanded: Vec<String> = Vec::new();
    for raw in names {
        let key = raw.trim().to_lowercase();
        if key.is_empty() {
            continue;
        }
        let mapped: &[&str] = match key.as_str() {
            "stochastic" => &["stoch"],
            "ema" => &["ema_20", "ema_50", "ema_200"],
            "sma" => &["sma_20", "sma_50", "sma_200"],
            "bb" => &["bbands"],
            "keltner" => &["kc"],
            "dc" => &["donchian"],
            "ad" => &["ad_line"],
            _ => &[],
        };
        if mapped.is_empty() {
            if !expanded.contains(&key) {
                expanded.push(key);
            }
        } else {
            for name in mapped {
                if !expanded.iter().any(|e| e == name) {
                    expanded.push((*name).to_string());
                }
            }
        }
    }
    expanded
}

/// Minimum number of candles before an indicator produces a usable value.
/// Also sizes the forward warm-up window.
pub fn min_history(name: &str) -> usize {
    match name {
        "rsi" => 15,
        "stoch" => 14,
        "cci" => 20,
        "mom" => 11,
        "ao" => 34,
        "macd" => 26,
        "ema_20" | "sma_20" => 20,
        "ema_50" | "sma_50" => 50,
        "ema_200" | "sma_200" => 200,
        "adx" => 28,
        "psar" => 2,
        "bbands" => 20,
        "atr" => 15,
        "kc" => 20,
        "donchian" => 20,
        "obv" => 1,
        "vwap" => 14,
        "mfi" => 15,
        "cmf" => 20,
        "ad_line" => 1,
        "supertrend" => 11,
        "ichimoku" => 9,
        "zscore" => 20,
        _ => 1,
    }
}

/// Largest lookback among the given canonical indicator names.
pub fn max_lookback(names: &[String]) -> usize {
    names.iter().map(|n| min_history(n)).max().unwrap_or(0)
}

/// Computes the full series for one standard indicator, warmup-masked.
pub fn compute_series(name: &str, candles: &[Candle]) -> Vec<f64> {
    let series = match name {
        "rsi" => from_close(RelativeStrengthIndex::new(14).unwrap(), candles),
        "stoch" => from_bars(FastStochastic::new(14).unwrap(), candles),
        "cci" => from_bars(CommodityChannelIndex::new(20).unwrap(), candles),
        "mom" => from_close(RateOfChange::new(10).unwrap(), candles),
        "ao" => awesome_oscillator(candles),
        "macd" => macd_line(candles),
        "ema_20" => from_close(ExponentialMovingAverage::new(20).unwrap(), candles),
        "ema_50" => from_close(ExponentialMovingAverage::new(50).unwrap(), candles),
        "ema_200" => from_close(ExponentialMovingAverage::new(200).unwrap(), candles),
        "sma_20" => from_close(SimpleMovingAverage::new(20).unwrap(), candles),
        "sma_50" => from_close(SimpleMovingAverage::new(50).unwrap(), candles),
        "sma_200" => from_close(SimpleMovingAverage::new(200).unwrap(), candles),
        "adx" => adx(candles, 14),
        "psar" => parabolic_sar(candles),
        "bbands" => bollinger_middle(candles),
        "atr" => from_bars(AverageTrueRange::new(14).unwrap(), candles),
        "kc" => keltner_middle(candles),
        "donchian" => channel_middle(candles, 20),
        "obv" => from_bars(OnBalanceVolume::new(), candles),
        "vwap" => rolling_vwap(candles, 14),
        "mfi" => from_bars(MoneyFlowIndex::new(14).unwrap(), candles),
        "cmf" => chaikin_money_flow(candles, 20),
        "ad_line" => accumulation_distribution(candles),
        "supertrend" => supertrend_lower_band(candles),
        "ichimoku" => channel_middle(candles, 9),
        "zscore" => zscore(candles, 20),
        _ => vec![f64::NAN; candles.len()],
    };
    masked(series, min_history(name))
}

fn masked(mut series: Vec<f64>, min_history: usize) -> Vec<f64> {
    let cut = min_history.saturating_sub(1).min(series.len());
    for value in series.iter_mut().take(cut) {
        *value = f64::NAN;
    }
    series
}

fn bar(candle: &Candle) -> Option<DataItem> {
    DataItem::builder()
        .open(candle.open)
        .high(candle.high)
        .low(candle.low)
        .close(candle.close)
        .volume(candle.volume)
        .build()
        .ok()
}

fn from_close<I>(mut indicator: I, candles: &[Candle]) -> Vec<f64>
where
    I: Next<f64, Output = f64>,
{
    candles.iter().map(|c| indicator.next(c.close)).collect()
}

fn from_bars<I>(mut indicator: I, candles: &[Candle]) -> Vec<f64>
where
    I: for<'a> Next<&'a DataItem, Output = f64>,
{
    candles
        .iter()
        .map(|candle| match bar(candle) {
            Some(item) => indicator.next(&item),
            None => f64::NAN,
        })
        .collect()
}

fn macd_line(candles: &[Candle]) -> Vec<f64> {
    let mut macd = MovingAverageConvergenceDivergence::new(12, 26, 9).unwrap();
    candles.iter().map(|c| macd.next(c.close).macd).collect()
}

fn bollinger_middle(candles: &[Candle]) -> Vec<f64> {
    let mut bb = BollingerBands::new(20, 2.0).unwrap();
    candles.iter().map(|c| bb.next(c.close).average).collect()
}

fn keltner_middle(candles: &[Candle]) -> Vec<f64> {
    let mut kc = KeltnerChannel::new(20, 2.0).unwrap();
    let mut out = Vec::with_capacity(candles.len());
    for candle in candles {
        match bar(candle) {
            Some(item) => out.push(kc.next(&item).average),
            None => out.push(f64::NAN),
        }
    }
    out
}

/// SMA(5) of the bar midpoint minus SMA(34) of the bar midpoint.
fn awesome_oscillator(candles: &[Candle]) -> Vec<f64> {
    let mut fast = SimpleMovingAverage::new(5).unwrap();
    let mut slow = SimpleMovingAverage::new(34).unwrap();
    candles
        .iter()
        .map(|c| {
            let mid = c.hl2();
            fast.next(mid) - slow.next(mid)
        })
        .collect()
}

/// Middle of the highest-high / lowest-low channel over `period` candles.
/// Covers both the Donchian middle (20) and the Ichimoku conversion line (9).
fn channel_middle(candles: &[Candle], period: usize) -> Vec<f64> {
    let mut highest = Maximum::new(period).unwrap();
    let mut lowest = Minimum::new(period).unwrap();
    candles
        .iter()
        .map(|c| (highest.next(c.high) + lowest.next(c.low)) / 2.0)
        .collect()
}

/// Wilder's ADX.
fn adx(candles: &[Candle], period: usize) -> Vec<f64> {
    let n = candles.len();
    let mut out = vec![f64::NAN; n];
    if n < 2 {
        return out;
    }

    let alpha = 1.0 / period as f64;
    let mut smoothed_tr = 0.0;
    let mut smoothed_plus = 0.0;
    let mut smoothed_minus = 0.0;
    let mut adx_value = f64::NAN;

    for i in 1..n {
        let current = &candles[i];
        let previous = &candles[i - 1];

        let tr = (current.high - current.low)
            .max((current.high - previous.close).abs())
            .max((current.low - previous.close).abs());
        let up_move = current.high - previous.high;
        let down_move = previous.low - current.low;
        let plus_dm = if up_move > down_move && up_move > 0.0 { up_move } else { 0.0 };
        let minus_dm = if down_move > up_move && down_move > 0.0 { down_move } else { 0.0 };

        if i == 1 {
            smoothed_tr = tr;
            smoothed_plus = plus_dm;
            smoothed_minus = minus_dm;
        } else {
            smoothed_tr = smoothed_tr * (1.0 - alpha) + tr * alpha;
            smoothed_plus = smoothed_plus * (1.0 - alpha) + plus_dm * alpha;
            smoothed_minus = smoothed_minus * (1.0 - alpha) + minus_dm * alpha;
        }

        let dx = if smoothed_tr > 0.0 {
            let plus_di = 100.0 * smoothed_plus / smoothed_tr;
            let minus_di = 100.0 * smoothed_minus / smoothed_tr;
            let di_sum = plus_di + minus_di;
            if di_sum > 0.0 {
                100.0 * (plus_di - minus_di).abs() / di_sum
            } else {
                0.0
            }
        } else {
            0.0
        };

        adx_value = if adx_value.is_nan() {
            dx
        } else {
            adx_value * (1.0 - alpha) + dx * alpha
        };
        out[i] = adx_value;
    }
    out
}

/// Parabolic SAR with the standard 0.02 step and 0.2 ceiling.
fn parabolic_sar(candles: &[Candle]) -> Vec<f64> {
    const AF_STEP: f64 = 0.02;
    const AF_MAX: f64 = 0.2;

    let n = candles.len();
    let mut out = vec![f64::NAN; n];
    if n < 2 {
        return out;
    }

    let mut rising = candles[1].close >= candles[0].close;
    let mut sar = if rising { candles[0].low } else { candles[0].high };
    let mut extreme = if rising { candles[0].high } else { candles[0].low };
    let mut af = AF_STEP;

    for i in 1..n {
        let candle = &candles[i];
        sar += af * (extreme - sar);

        if rising {
            if candle.low < sar {
                rising = false;
                sar = extreme;
                extreme = candle.low;
                af = AF_STEP;
            } else if candle.high > extreme {
                extreme = candle.high;
                af = (af + AF_STEP).min(AF_MAX);
            }
        } else if candle.high > sar {
            rising = true;
            sar = extreme;
            extreme = candle.high;
            af = AF_STEP;
        } else if candle.low < extreme {
            extreme = candle.low;
            af = (af + AF_STEP).min(AF_MAX);
        }

        out[i] = sar;
    }
    out
}

/// Rolling volume-weighted average of the typical price.
fn rolling_vwap(candles: &[Candle], period: usize) -> Vec<f64> {
    let mut out = Vec::with_capacity(candles.len());
    for i in 0..candles.len() {
        let start = (i + 1).saturating_sub(period);
        let window = &candles[start..=i];
        let pv: f64 = window.iter().map(|c| c.typical_price() * c.volume).sum();
        let volume: f64 = window.iter().map(|c| c.volume).sum();
        out.push(if volume > 0.0 { pv / volume } else { f64::NAN });
    }
    out
}

fn money_flow_volume(candle: &Candle) -> f64 {
    let range = candle.range();
    if range <= 0.0 {
        return 0.0;
    }
    let multiplier = ((candle.close - candle.low) - (candle.high - candle.close)) / range;
    multiplier * candle.volume
}

/// Chaikin Money Flow over a rolling window.
fn chaikin_money_flow(candles: &[Candle], period: usize) -> Vec<f64> {
    let mut out = Vec::with_capacity(candles.len());
    for i in 0..candles.len() {
        let start = (i + 1).saturating_sub(period);
        let window = &candles[start..=i];
        let mfv: f64 = window.iter().map(money_flow_volume).sum();
        let volume: f64 = window.iter().map(|c| c.volume).sum();
        out.push(if volume > 0.0 { mfv / volume } else { f64::NAN });
    }
    out
}

/// Cumulative accumulation/distribution line.
fn accumulation_distribution(candles: &[Candle]) -> Vec<f64> {
    let mut total = 0.0;
    candles
        .iter()
        .map(|c| {
            total += money_flow_volume(c);
            total
        })
        .collect()
}

/// Lower band of a Supertrend built on ATR(10) with multiplier 3.
fn supertrend_lower_band(candles: &[Candle]) -> Vec<f64> {
    let atr_series = from_bars(AverageTrueRange::new(10).unwrap(), candles);
    candles
        .iter()
        .zip(atr_series)
        .map(|(c, atr)| c.hl2() - 3.0 * atr)
        .collect()
}

/// Rolling z-score of the close over `period` candles.
fn zscore(candles: &[Candle], period: usize) -> Vec<f64> {
    let mut mean = SimpleMovingAverage::new(period).unwrap();
    let mut deviation = StandardDeviation::new(period).unwrap();
    candles
        .iter()
        .map(|c| {
            let m = mean.next(c.close);
            let sd = deviation.next(c.close);
            if sd > 0.0 { (c.close - m) / sd } else { f64::NAN }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn series(closes: &[f64]) -> Vec<Candle> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| {
                Candle::new(
                    start + Duration::hours(i as i64),
                    close,
                    close + 1.0,
                    close - 1.0,
                    close,
                    100.0,
                )
                .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_alias_expansion() {
        let names = vec!["EMA".to_string(), "bb".to_string(), "rsi".to_string()];
        assert_eq!(
            expand_aliases(&names),
            vec!["ema_20", "ema_50", "ema_200", "bbands", "rsi"]
        );
    }

    #[test]
    fn test_alias_expansion_dedupes() {
        let names = vec!["rsi".to_string(), "RSI ".to_string(), "stochastic".to_string()];
        assert_eq!(expand_aliases(&names), vec!["rsi", "stoch"]);
    }

    #[test]
    fn test_sma_warmup_masked() {
        let candles = series(&[1.0; 30]);
        let sma = compute_series("sma_20", &candles);
        assert!(sma[18].is_nan());
        assert!((sma[19] - 1.0).abs() < 1e-9);
        assert!((sma[29] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_rsi_bounds_after_warmup() {
        let closes: Vec<f64> = (0..60).map(|i| 100.0 + (i as f64 * 0.7).sin() * 5.0).collect();
        let candles = series(&closes);
        let rsi = compute_series("rsi", &candles);
        assert!(rsi[13].is_nan());
        for value in rsi.iter().skip(14) {
            assert!((0.0..=100.0).contains(value), "rsi out of bounds: {value}");
        }
    }

    #[test]
    fn test_zscore_flat_series_is_nan() {
        // Zero standard deviation must not divide to infinity.
        let candles = series(&[100.0; 40]);
        let z = compute_series("zscore", &candles);
        assert!(z[25].is_nan());
    }

    #[test]
    fn test_donchian_middle() {
        let closes: Vec<f64> = (0..25).map(|i| 100.0 + i as f64).collect();
        let candles = series(&closes);
        let donchian = compute_series("donchian", &candles);
        // At index 24 the 20-candle window spans closes 105..=124; highs are
        // close+1, lows close-1, so the middle is (125 + 104) / 2.
        assert!((donchian[24] - 114.5).abs() < 1e-9);
    }

    #[test]
    fn test_max_lookback() {
        let names = vec!["rsi".to_string(), "sma_200".to_string(), "atr".to_string()];
        assert_eq!(max_lookback(&names), 200);
        assert_eq!(max_lookback(&[]), 0);
    }

    #[test]
    fn test_ad_line_has_no_warmup() {
        let candles = series(&[10.0, 11.0, 12.0]);
        let ad = compute_series("ad_line", &candles);
        assert!(!ad[0].is_nan());
    }
}
