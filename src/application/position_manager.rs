//! Simulated position management: one open position per session, safety-mode
//! stop tightening, path-aware SL/TP triggers, and aggregate statistics.

use crate::domain::trading::{CloseReason, Position, Side, Trade, TradingStats};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

/// Adverse move (fraction of entry) the safety stop is tightened to.
const SAFETY_STOP_PCT: f64 = 0.02;

pub struct PositionManager {
    starting_capital: f64,
    /// Realized equity; unrealized PnL is added on top by `total_equity`.
    equity: f64,
    safety_mode: bool,
    position: Option<Position>,
    closed_trades: Vec<Trade>,
}

impl PositionManager {
    pub fn new(starting_capital: f64, safety_mode: bool) -> Self {
        Self {
            starting_capital,
            equity: starting_capital,
            safety_mode,
            position: None,
            closed_trades: Vec::new(),
        }
    }

    pub fn has_open_position(&self) -> bool {
        self.position.is_some()
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    pub fn starting_capital(&self) -> f64 {
        self.starting_capital
    }

    /// Realized equity, excluding any open position's unrealized PnL.
    pub fn equity(&self) -> f64 {
        self.equity
    }

    pub fn closed_trades(&self) -> &[Trade] {
        &self.closed_trades
    }

    /// Opens a position. Returns false (and leaves state untouched) when a
    /// position already exists, the size fraction is outside (0, 1], or the
    /// leverage is outside [1, 5].
    pub fn open_position(
        &mut self,
        side: Side,
        entry_price: f64,
        size_pct: f64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
        leverage: u8,
        entry_time: DateTime<Utc>,
    ) -> bool {
        if self.position.is_some() {
            return false;
        }
        if !(entry_price.is_finite() && entry_price > 0.0) {
            return false;
        }
        if size_pct <= 0.0 || size_pct > 1.0 {
            return false;
        }
        if !(1..=5).contains(&leverage) {
            return false;
        }

        let capital_to_use = self.equity * size_pct;
        let size = (capital_to_use * leverage as f64) / entry_price;

        // Safety mode tightens a missing or too-loose stop to a 2% adverse
        // move from entry.
        let mut stop_loss = stop_loss;
        if self.safety_mode {
            match side {
                Side::Long => {
                    let safety_stop = entry_price * (1.0 - SAFETY_STOP_PCT);
                    if stop_loss.is_none_or(|sl| sl < safety_stop) {
                        stop_loss = Some(safety_stop);
                    }
                }
                Side::Short => {
                    let safety_stop = entry_price * (1.0 + SAFETY_STOP_PCT);
                    if stop_loss.is_none_or(|sl| sl > safety_stop) {
                        stop_loss = Some(safety_stop);
                    }
                }
            }
        }

        info!(
            "PositionManager: opening {} @ {:.4} size={:.6} lev={} sl={:?} tp={:?}",
            side, entry_price, size, leverage, stop_loss, take_profit
        );

        self.position = Some(Position {
            side,
            entry_price,
            size,
            stop_loss,
            take_profit,
            entry_time,
            leverage,
            unrealized_pnl: 0.0,
        });
        true
    }

    /// Refreshes unrealized PnL from the close, then checks SL/TP triggers
    /// against the candle's high and low. When both ranges are crossed in the
    /// same candle the stop-loss wins (worst-case assumption).
    pub fn update_position(
        &mut self,
        candle_high: f64,
        candle_low: f64,
        current_price: f64,
        at: DateTime<Utc>,
    ) -> Option<CloseReason> {
        let (side, stop_loss, take_profit) = {
            let position = self.position.as_mut()?;
            let price_change = match position.side {
                Side::Long => current_price - position.entry_price,
                Side::Short => position.entry_price - current_price,
            };
            position.unrealized_pnl = price_change * position.size;
            (position.side, position.stop_loss, position.take_profit)
        };

        match side {
            Side::Long => {
                if let Some(sl) = stop_loss
                    && candle_low <= sl
                {
                    self.close_position(sl, CloseReason::StopLoss, at);
                    return Some(CloseReason::StopLoss);
                }
                if let Some(tp) = take_profit
                    && candle_high >= tp
                {
                    self.close_position(tp, CloseReason::TakeProfit, at);
                    return Some(CloseReason::TakeProfit);
                }
            }
            Side::Short => {
                if let Some(sl) = stop_loss
                    && candle_high >= sl
                {
                    self.close_position(sl, CloseReason::StopLoss, at);
                    return Some(CloseReason::StopLoss);
                }
                if let Some(tp) = take_profit
                    && candle_low <= tp
                {
                    self.close_position(tp, CloseReason::TakeProfit, at);
                    return Some(CloseReason::TakeProfit);
                }
            }
        }
        None
    }

    /// Closes the open position at `exit_price`, realizing PnL into equity
    /// and appending the trade record.
    pub fn close_position(
        &mut self,
        exit_price: f64,
        reason: CloseReason,
        at: DateTime<Utc>,
    ) -> Option<Trade> {
        let position = self.position.take()?;

        let price_change = match position.side {
            Side::Long => exit_price - position.entry_price,
            Side::Short => position.entry_price - exit_price,
        };
        let realized_pnl = price_change * position.size;

        // Percent PnL is over the committed margin, not the notional.
        let margin = position.margin();
        let pnl_pct = if margin > 0.0 {
            (realized_pnl / margin) * 100.0
        } else {
            0.0
        };

        self.equity += realized_pnl;

        debug!(
            "PositionManager: closed {} @ {:.4} reason={} pnl={:.4} ({:.2}%)",
            position.side, exit_price, reason, realized_pnl, pnl_pct
        );

        let trade = Trade {
            side: position.side,
            entry_price: position.entry_price,
            exit_price,
            size: position.size,
            pnl: realized_pnl,
            pnl_pct,
            entry_time: position.entry_time,
            exit_time: at,
            reason,
            leverage: position.leverage,
        };
        self.closed_trades.push(trade.clone());
        Some(trade)
    }

    /// Equity including the open position's unrealized PnL.
    pub fn total_equity(&self) -> f64 {
        let unrealized = self
            .position
            .as_ref()
            .map(|p| p.unrealized_pnl)
            .unwrap_or(0.0);
        self.equity + unrealized
    }

    /// Aggregate statistics, rounded to 2 decimals at this boundary only.
    pub fn stats(&self) -> TradingStats {
        let total_trades = self.closed_trades.len();
        if total_trades == 0 {
            return TradingStats {
                total_trades: 0,
                winning_trades: 0,
                losing_trades: 0,
                win_rate: 0.0,
                total_pnl: 0.0,
                total_pnl_pct: 0.0,
                average_win: 0.0,
                average_loss: 0.0,
                largest_win: 0.0,
                largest_loss: 0.0,
                profit_factor: 0.0,
                current_equity: round2(self.total_equity()),
                equity_change_pct: 0.0,
            };
        }

        let winners: Vec<&Trade> = self.closed_trades.iter().filter(|t| t.pnl > 0.0).collect();
        let losers: Vec<&Trade> = self.closed_trades.iter().filter(|t| t.pnl <= 0.0).collect();

        let total_pnl: f64 = self.closed_trades.iter().map(|t| t.pnl).sum();
        let gross_profit: f64 = winners.iter().map(|t| t.pnl).sum();
        let gross_loss: f64 = losers.iter().map(|t| t.pnl).sum::<f64>().abs();

        let average_win = if winners.is_empty() {
            0.0
        } else {
            gross_profit / winners.len() as f64
        };
        let average_loss = if losers.is_empty() {
            0.0
        } else {
            gross_loss / losers.len() as f64
        };
        let largest_win = winners.iter().map(|t| t.pnl).fold(0.0, f64::max);
        let largest_loss = losers.iter().map(|t| t.pnl).fold(0.0, f64::min);
        let profit_factor = if gross_loss > 0.0 {
            gross_profit / gross_loss
        } else {
            0.0
        };

        let win_rate = (winners.len() as f64 / total_trades as f64) * 100.0;
        let total_pnl_pct = (total_pnl / self.starting_capital) * 100.0;
        let current_equity = self.total_equity();
        let equity_change_pct =
            ((current_equity - self.starting_capital) / self.starting_capital) * 100.0;

        TradingStats {
            total_trades,
            winning_trades: winners.len(),
            losing_trades: losers.len(),
            win_rate: round2(win_rate),
            total_pnl: round2(total_pnl),
            total_pnl_pct: round2(total_pnl_pct),
            average_win: round2(average_win),
            average_loss: round2(average_loss),
            largest_win: round2(largest_win),
            largest_loss: round2(largest_loss),
            profit_factor: round2(profit_factor),
            current_equity: round2(current_equity),
            equity_change_pct: round2(equity_change_pct),
        }
    }

    pub fn reset(&mut self) {
        self.equity = self.starting_capital;
        self.position = None;
        self.closed_trades.clear();
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_open_validations() {
        let mut pm = PositionManager::new(10_000.0, false);
        assert!(!pm.open_position(Side::Long, 100.0, 0.0, None, None, 1, ts()));
        assert!(!pm.open_position(Side::Long, 100.0, 1.5, None, None, 1, ts()));
        assert!(!pm.open_position(Side::Long, 100.0, 0.5, None, None, 0, ts()));
        assert!(!pm.open_position(Side::Long, 100.0, 0.5, None, None, 6, ts()));
        assert!(pm.open_position(Side::Long, 100.0, 0.5, None, None, 1, ts()));
        // Second open rejected while a position exists.
        assert!(!pm.open_position(Side::Short, 100.0, 0.5, None, None, 1, ts()));
    }

    #[test]
    fn test_size_accounts_for_leverage() {
        let mut pm = PositionManager::new(10_000.0, false);
        assert!(pm.open_position(Side::Long, 100.0, 0.5, None, None, 3, ts()));
        // 10000 * 0.5 * 3 / 100 = 150 units
        assert!((pm.position().unwrap().size - 150.0).abs() < 1e-9);
    }

    #[test]
    fn test_safety_mode_tightens_missing_stop() {
        let mut pm = PositionManager::new(10_000.0, true);
        assert!(pm.open_position(Side::Long, 100.0, 0.5, None, None, 1, ts()));
        assert!((pm.position().unwrap().stop_loss.unwrap() - 98.0).abs() < 1e-9);
    }

    #[test]
    fn test_safety_mode_tightens_loose_stop_short() {
        let mut pm = PositionManager::new(10_000.0, true);
        assert!(pm.open_position(Side::Short, 100.0, 0.5, Some(110.0), None, 1, ts()));
        assert!((pm.position().unwrap().stop_loss.unwrap() - 102.0).abs() < 1e-9);
    }

    #[test]
    fn test_safety_mode_keeps_tighter_stop() {
        let mut pm = PositionManager::new(10_000.0, true);
        assert!(pm.open_position(Side::Long, 100.0, 0.5, Some(99.5), None, 1, ts()));
        assert!((pm.position().unwrap().stop_loss.unwrap() - 99.5).abs() < 1e-9);
    }

    #[test]
    fn test_long_stop_loss_triggers_on_low() {
        let mut pm = PositionManager::new(10_000.0, false);
        pm.open_position(Side::Long, 100.0, 0.5, Some(98.0), None, 1, ts());
        let reason = pm.update_position(101.0, 97.0, 100.5, ts());
        assert_eq!(reason, Some(CloseReason::StopLoss));
        let trade = &pm.closed_trades()[0];
        assert!((trade.exit_price - 98.0).abs() < 1e-9);
        // (98 - 100) * 50 units = -100
        assert!((trade.pnl + 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_short_take_profit_triggers_on_low() {
        let mut pm = PositionManager::new(10_000.0, false);
        pm.open_position(Side::Short, 100.0, 0.5, None, Some(95.0), 1, ts());
        let reason = pm.update_position(99.0, 94.0, 96.0, ts());
        assert_eq!(reason, Some(CloseReason::TakeProfit));
        let trade = &pm.closed_trades()[0];
        assert!(trade.pnl > 0.0);
    }

    #[test]
    fn test_stop_loss_precedes_take_profit_same_candle() {
        let mut pm = PositionManager::new(10_000.0, false);
        pm.open_position(Side::Long, 100.0, 0.5, Some(98.0), Some(102.0), 1, ts());
        // Candle crosses both levels; conservative resolution is the stop.
        let reason = pm.update_position(103.0, 97.0, 100.0, ts());
        assert_eq!(reason, Some(CloseReason::StopLoss));
    }

    #[test]
    fn test_open_close_same_price_is_flat() {
        for leverage in 1..=5u8 {
            let mut pm = PositionManager::new(10_000.0, false);
            pm.open_position(Side::Long, 100.0, 0.5, None, None, leverage, ts());
            let trade = pm
                .close_position(100.0, CloseReason::AiDecision, ts())
                .unwrap();
            assert_eq!(trade.pnl, 0.0);
            assert_eq!(pm.equity(), 10_000.0);
        }
    }

    #[test]
    fn test_pnl_pct_is_over_margin() {
        let mut pm = PositionManager::new(10_000.0, false);
        pm.open_position(Side::Long, 100.0, 0.5, None, None, 4, ts());
        // size = 10000*0.5*4/100 = 200 units; margin = 100*200/4 = 5000
        let trade = pm
            .close_position(101.0, CloseReason::AiDecision, ts())
            .unwrap();
        assert!((trade.pnl - 200.0).abs() < 1e-9);
        assert!((trade.pnl_pct - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_stats_empty() {
        let pm = PositionManager::new(10_000.0, false);
        let stats = pm.stats();
        assert_eq!(stats.total_trades, 0);
        assert_eq!(stats.current_equity, 10_000.0);
        assert_eq!(stats.profit_factor, 0.0);
    }

    #[test]
    fn test_stats_aggregation() {
        let mut pm = PositionManager::new(10_000.0, false);

        pm.open_position(Side::Long, 100.0, 0.1, None, None, 1, ts());
        pm.close_position(110.0, CloseReason::AiDecision, ts()); // +100

        pm.open_position(Side::Long, 100.0, 0.1, None, None, 1, ts());
        pm.close_position(95.0, CloseReason::StopLoss, ts()); // -50.5

        let stats = pm.stats();
        assert_eq!(stats.total_trades, 2);
        assert_eq!(stats.winning_trades, 1);
        assert_eq!(stats.losing_trades, 1);
        assert_eq!(stats.win_rate, 50.0);
        assert!(stats.profit_factor > 0.0);
        assert_eq!(stats.largest_win, stats.total_pnl + stats.largest_loss.abs());
    }

    #[test]
    fn test_unrealized_pnl_in_total_equity() {
        let mut pm = PositionManager::new(10_000.0, false);
        pm.open_position(Side::Long, 100.0, 0.5, None, None, 1, ts());
        pm.update_position(106.0, 104.0, 105.0, ts());
        // 50 units * +5 = +250 unrealized
        assert!((pm.total_equity() - 10_250.0).abs() < 1e-9);
        assert!((pm.equity() - 10_000.0).abs() < 1e-9);
    }

    #[test]
    fn test_reset() {
        let mut pm = PositionManager::new(10_000.0, false);
        pm.open_position(Side::Long, 100.0, 0.5, None, None, 1, ts());
        pm.close_position(110.0, CloseReason::Manual, ts());
        pm.reset();
        assert_eq!(pm.equity(), 10_000.0);
        assert!(pm.closed_trades().is_empty());
        assert!(!pm.has_open_position());
    }
}
