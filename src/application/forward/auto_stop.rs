//! Auto-stop policy for forward sessions.
//!
//! Evaluated after each processed candle; the current predicate is a
//! cumulative-loss threshold over equity including unrealized PnL.

use crate::domain::trading::TradingStats;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AutoStopPolicy {
    pub enabled: bool,
    /// Stop once cumulative PnL% drops to or below minus this value.
    pub loss_pct: Option<f64>,
}

impl AutoStopPolicy {
    pub fn loss_threshold(loss_pct: f64) -> Self {
        Self {
            enabled: true,
            loss_pct: Some(loss_pct),
        }
    }

    pub fn should_stop(&self, stats: &TradingStats) -> bool {
        if !self.enabled {
            return false;
        }
        match self.loss_pct {
            Some(threshold) => stats.equity_change_pct <= -threshold,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats_with_change(equity_change_pct: f64) -> TradingStats {
        TradingStats {
            total_trades: 1,
            winning_trades: 0,
            losing_trades: 1,
            win_rate: 0.0,
            total_pnl: 0.0,
            total_pnl_pct: equity_change_pct,
            average_win: 0.0,
            average_loss: 0.0,
            largest_win: 0.0,
            largest_loss: 0.0,
            profit_factor: 0.0,
            current_equity: 0.0,
            equity_change_pct,
        }
    }

    #[test]
    fn test_disabled_never_stops() {
        let policy = AutoStopPolicy::default();
        assert!(!policy.should_stop(&stats_with_change(-99.0)));
    }

    #[test]
    fn test_threshold_inclusive() {
        let policy = AutoStopPolicy::loss_threshold(5.0);
        assert!(!policy.should_stop(&stats_with_change(-4.99)));
        assert!(policy.should_stop(&stats_with_change(-5.0)));
        assert!(policy.should_stop(&stats_with_change(-12.0)));
    }

    #[test]
    fn test_enabled_without_threshold_never_stops() {
        let policy = AutoStopPolicy {
            enabled: true,
            loss_pct: None,
        };
        assert!(!policy.should_stop(&stats_with_change(-50.0)));
    }
}
