//! Position-attention overrides and low-volatility skips.
//!
//! Overrides upgrade a non-cadence candle to a full decision step when an
//! open position needs review; the volatility check goes the other way and
//! suppresses a scheduled call when the market is flat and no position is
//! open.

use crate::application::session::state::SessionState;
use crate::domain::events::IndicatorMap;
use crate::domain::market::Candle;

/// Force a decision when SL or TP sits within this fraction of price.
const SL_TP_PROXIMITY_PCT: f64 = 1.0;
/// Force a decision when |unrealized PnL| exceeds this share of notional.
const SIGNIFICANT_PNL_PCT: f64 = 2.0;
/// Force a decision after this many candles without a position review.
const EXTENDED_PERIOD_CANDLES: usize = 50;

/// Skip a scheduled call when current volatility is below this share of the
/// recent average.
const LOW_VOLATILITY_THRESHOLD: f64 = 0.5;
const VOLATILITY_WINDOW: usize = 5;

/// Returns the reason a full decision step must run for this candle despite
/// the cadence, or None when nothing demands attention.
pub fn force_decision_reason(state: &SessionState, index: usize, candle: &Candle) -> Option<String> {
    let position = state.positions.position()?;
    let current_price = candle.close;
    if current_price <= 0.0 {
        return None;
    }

    if let Some(stop_loss) = position.stop_loss {
        let distance_pct = (stop_loss - current_price).abs() / current_price * 100.0;
        if distance_pct < SL_TP_PROXIMITY_PCT {
            return Some(format!(
                "Position near stop-loss (within {SL_TP_PROXIMITY_PCT}%)"
            ));
        }
    }
    if let Some(take_profit) = position.take_profit {
        let distance_pct = (take_profit - current_price).abs() / current_price * 100.0;
        if distance_pct < SL_TP_PROXIMITY_PCT {
            return Some(format!(
                "Position near take-profit (within {SL_TP_PROXIMITY_PCT}%)"
            ));
        }
    }

    let notional = position.notional();
    if notional > 0.0 {
        let pnl_pct = position.unrealized_pnl.abs() / notional * 100.0;
        if pnl_pct > SIGNIFICANT_PNL_PCT {
            return Some(format!(
                "Significant unrealized PnL ({pnl_pct:.2}% of position notional)"
            ));
        }
    }

    // Find when the position was opened from the recent decision journal.
    let entry_candle = state
        .thoughts
        .iter()
        .rev()
        .take(20)
        .find(|thought| thought.decision == "LONG" || thought.decision == "SHORT")
        .map(|thought| thought.candle_number);
    if let Some(entry_candle) = entry_candle {
        let candles_since_entry = (index as i64 - entry_candle).max(0) as usize;
        if candles_since_entry >= EXTENDED_PERIOD_CANDLES {
            return Some(format!(
                "Position open for {candles_since_entry} candles without review"
            ));
        }
    }

    None
}

/// Returns the reason to skip a scheduled LLM call for a flat market, or
/// None when the call should run. Only meaningful with no open position.
pub fn low_volatility_skip_reason(
    state: &SessionState,
    index: usize,
    indicators: &IndicatorMap,
) -> Option<String> {
    if index < VOLATILITY_WINDOW {
        return None;
    }

    // Preferred signal: ATR against its recent average.
    if let Some(Some(current_atr)) = indicators.get("atr") {
        let recent: Vec<f64> = (index.saturating_sub(VOLATILITY_WINDOW)..index)
            .filter_map(|i| state.pipeline.values_at(i).ok())
            .filter_map(|values| values.get("atr").copied().flatten())
            .collect();
        if recent.len() >= 3 {
            let average = recent.iter().sum::<f64>() / recent.len() as f64;
            if average > 0.0 && *current_atr < average * LOW_VOLATILITY_THRESHOLD {
                return Some(format!(
                    "Low volatility (ATR {:.2} < {:.0}% of avg {:.2})",
                    current_atr,
                    LOW_VOLATILITY_THRESHOLD * 100.0,
                    average
                ));
            }
        }
    }

    // Fallback signal: raw candle range against its recent average.
    let start = index.saturating_sub(VOLATILITY_WINDOW);
    let ranges: Vec<f64> = state.candles[start..=index].iter().map(Candle::range).collect();
    if ranges.len() > 1 {
        let current_range = *ranges.last().unwrap();
        let average = ranges[..ranges.len() - 1].iter().sum::<f64>() / (ranges.len() - 1) as f64;
        if average > 0.0 && current_range < average * LOW_VOLATILITY_THRESHOLD {
            return Some(format!(
                "Low volatility (price range {:.2} < {:.0}% of avg {:.2})",
                current_range,
                LOW_VOLATILITY_THRESHOLD * 100.0,
                average
            ));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::indicators::IndicatorPipeline;
    use crate::application::position_manager::PositionManager;
    use crate::application::session::state::{DecisionCadence, SessionState};
    use crate::domain::agent::{AgentConfig, AgentMode};
    use crate::domain::decision::Decision;
    use crate::domain::market::{PlaybackSpeed, Timeframe};
    use crate::domain::ports::{DecisionProvider, DecisionRequest};
    use crate::domain::trading::Side;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone, Utc};
    use std::sync::Arc;

    struct NullProvider;

    #[async_trait]
    impl DecisionProvider for NullProvider {
        async fn decide(&self, _request: DecisionRequest) -> Decision {
            Decision::hold("test")
        }
    }

    fn flat_candles(n: usize, price: f64) -> Vec<Candle> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (0..n)
            .map(|i| {
                Candle::new(
                    start + Duration::hours(i as i64),
                    price,
                    price + 1.0,
                    price - 1.0,
                    price,
                    100.0,
                )
                .unwrap()
            })
            .collect()
    }

    fn state_with(candles: Vec<Candle>) -> SessionState {
        let pipeline = IndicatorPipeline::new(&candles, &[], AgentMode::Omni, &[]).unwrap();
        SessionState {
            session_id: "s".to_string(),
            agent: AgentConfig {
                id: uuid::Uuid::new_v4(),
                name: "a".to_string(),
                mode: AgentMode::Omni,
                model: "m".to_string(),
                strategy_prompt: String::new(),
                indicators: vec![],
                custom_indicators: vec![],
                api_key_id: None,
            },
            asset: "BTC/USDT".to_string(),
            timeframe: Timeframe::OneHour,
            candles,
            current_index: 0,
            positions: PositionManager::new(10_000.0, false),
            pipeline,
            provider: Arc::new(NullProvider),
            decision_start_index: 0,
            allow_leverage: false,
            cadence: DecisionCadence::EveryCandle,
            playback_speed: PlaybackSpeed::Instant,
            thoughts: vec![],
            equity_curve: vec![],
            peak_equity: 10_000.0,
            max_drawdown_pct: 0.0,
            pending_order: None,
            started_at: None,
            council_mode: false,
        }
    }

    #[test]
    fn test_no_position_never_forces() {
        let state = state_with(flat_candles(10, 100.0));
        assert!(force_decision_reason(&state, 5, &state.candles[5]).is_none());
    }

    #[test]
    fn test_force_near_stop_loss() {
        let mut state = state_with(flat_candles(10, 100.0));
        state
            .positions
            .open_position(Side::Long, 100.0, 0.5, Some(99.5), None, 1, Utc::now());
        let reason = force_decision_reason(&state, 5, &state.candles[5]).unwrap();
        assert!(reason.contains("stop-loss"));
    }

    #[test]
    fn test_force_on_significant_pnl() {
        let mut state = state_with(flat_candles(10, 100.0));
        state
            .positions
            .open_position(Side::Long, 100.0, 0.5, Some(90.0), None, 1, Utc::now());
        // Mark well away from SL/TP but with >2% of notional unrealized.
        state.positions.update_position(104.0, 102.5, 103.0, Utc::now());
        let candle = Candle::new(Utc::now(), 103.0, 104.0, 102.5, 103.0, 10.0).unwrap();
        let reason = force_decision_reason(&state, 5, &candle).unwrap();
        assert!(reason.contains("unrealized PnL"));
    }

    #[test]
    fn test_low_volatility_range_fallback() {
        let mut candles = flat_candles(10, 100.0);
        // Current candle has a fifth of the usual range.
        let quiet = Candle::new(
            candles[9].timestamp + Duration::hours(1),
            100.0,
            100.2,
            99.9,
            100.0,
            100.0,
        )
        .unwrap();
        candles.push(quiet);
        let state = state_with(candles);
        let reason = low_volatility_skip_reason(&state, 10, &IndicatorMap::new()).unwrap();
        assert!(reason.contains("Low volatility"));
    }

    #[test]
    fn test_normal_volatility_not_skipped() {
        let state = state_with(flat_candles(12, 100.0));
        assert!(low_volatility_skip_reason(&state, 10, &IndicatorMap::new()).is_none());
    }

    #[test]
    fn test_early_candles_never_skip() {
        let state = state_with(flat_candles(12, 100.0));
        assert!(low_volatility_skip_reason(&state, 3, &IndicatorMap::new()).is_none());
    }
}
