//! In-memory state owned by one session's driver task.

use crate::application::indicators::IndicatorPipeline;
use crate::application::position_manager::PositionManager;
use crate::domain::agent::AgentConfig;
use crate::domain::events::IndicatorMap;
use crate::domain::market::{Candle, PlaybackSpeed, Timeframe};
use crate::domain::ports::{DecisionProvider, RecentIndicators};
use crate::domain::repositories::ThoughtRecord;
use crate::domain::trading::PendingOrder;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

/// Full context window handed to the model when a position is open or the
/// decision was forced; reduced window otherwise.
pub const HISTORY_WINDOW: usize = 20;
pub const MIN_HISTORY_WINDOW: usize = 10;

/// Which candles trigger an LLM call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionCadence {
    EveryCandle,
    EveryNCandles(usize),
}

impl DecisionCadence {
    /// Whether `index` is a scheduled decision candle, counting intervals
    /// from the decision-start index so warm-up never consumes a slot.
    pub fn is_decision_candle(&self, decision_start: usize, index: usize) -> bool {
        match self {
            DecisionCadence::EveryCandle => true,
            DecisionCadence::EveryNCandles(interval) => {
                let interval = (*interval).max(1);
                index.saturating_sub(decision_start) % interval == 0
            }
        }
    }

    /// Pre-computes every scheduled LLM call point over `[decision_start, total)`.
    pub fn call_points(&self, decision_start: usize, total: usize) -> HashSet<usize> {
        (decision_start..total)
            .filter(|&i| self.is_decision_candle(decision_start, i))
            .collect()
    }
}

/// One sample of the equity curve.
#[derive(Debug, Clone, Serialize)]
pub struct EquityPoint {
    pub time: DateTime<Utc>,
    pub value: f64,
    pub drawdown: f64,
}

pub struct SessionState {
    pub session_id: String,
    pub agent: AgentConfig,
    pub asset: String,
    pub timeframe: Timeframe,
    pub candles: Vec<Candle>,
    pub current_index: usize,
    pub positions: PositionManager,
    pub pipeline: IndicatorPipeline,
    pub provider: Arc<dyn DecisionProvider>,
    pub decision_start_index: usize,
    pub allow_leverage: bool,
    pub cadence: DecisionCadence,
    pub playback_speed: PlaybackSpeed,
    pub thoughts: Vec<ThoughtRecord>,
    pub equity_curve: Vec<EquityPoint>,
    pub peak_equity: f64,
    /// Worst drawdown seen so far, as a non-positive percentage.
    pub max_drawdown_pct: f64,
    pub pending_order: Option<PendingOrder>,
    pub started_at: Option<DateTime<Utc>>,
    pub council_mode: bool,
}

impl SessionState {
    /// Appends an equity sample and refreshes peak/drawdown tracking.
    pub fn record_equity(&mut self, time: DateTime<Utc>, equity: f64) {
        if equity > self.peak_equity {
            self.peak_equity = equity;
        }
        let drawdown = if self.peak_equity > 0.0 {
            ((equity - self.peak_equity) / self.peak_equity) * 100.0
        } else {
            0.0
        };
        if drawdown < self.max_drawdown_pct {
            self.max_drawdown_pct = drawdown;
        }
        self.equity_curve.push(EquityPoint {
            time,
            value: equity,
            drawdown,
        });
    }

    pub fn elapsed_seconds(&self) -> i64 {
        self.started_at
            .map(|started| (Utc::now() - started).num_seconds())
            .unwrap_or(0)
    }

    pub fn equity_curve_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.equity_curve).unwrap_or(serde_json::Value::Null)
    }

    pub fn open_position_json(&self) -> Option<serde_json::Value> {
        self.positions
            .position()
            .and_then(|p| serde_json::to_value(p).ok())
    }

    /// Recent candles and indicator snapshots for the model's context.
    /// The window shrinks when no position is open and nothing forced the
    /// decision, to keep flat-market prompts cheap.
    pub fn build_decision_history(
        &self,
        index: usize,
        force_full: bool,
    ) -> (Vec<Candle>, Vec<RecentIndicators>) {
        let window = if force_full || self.positions.has_open_position() {
            HISTORY_WINDOW
        } else {
            MIN_HISTORY_WINDOW
        };
        let start = (index + 1).saturating_sub(window);

        let recent_candles = self.candles[start..=index.min(self.candles.len() - 1)].to_vec();
        let recent_indicators = (start..=index.min(self.pipeline.len().saturating_sub(1)))
            .map(|i| RecentIndicators {
                candle_index: i,
                values: self.pipeline.values_at(i).unwrap_or_default(),
            })
            .collect();

        (recent_candles, recent_indicators)
    }

    /// Indicator map for `index`, or an empty map when the pipeline does not
    /// cover it (fast-forward candles broadcast without indicators).
    pub fn indicators_at(&self, index: usize) -> IndicatorMap {
        self.pipeline.values_at(index).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_candle_cadence() {
        let cadence = DecisionCadence::EveryCandle;
        assert!(cadence.is_decision_candle(10, 10));
        assert!(cadence.is_decision_candle(10, 999));
        assert_eq!(cadence.call_points(3, 6), HashSet::from([3, 4, 5]));
    }

    #[test]
    fn test_every_n_candles_cadence() {
        let cadence = DecisionCadence::EveryNCandles(4);
        assert!(cadence.is_decision_candle(10, 10));
        assert!(!cadence.is_decision_candle(10, 11));
        assert!(cadence.is_decision_candle(10, 14));
        assert_eq!(cadence.call_points(0, 9), HashSet::from([0, 4, 8]));
    }

    #[test]
    fn test_zero_interval_treated_as_one() {
        let cadence = DecisionCadence::EveryNCandles(0);
        assert!(cadence.is_decision_candle(0, 7));
    }
}
