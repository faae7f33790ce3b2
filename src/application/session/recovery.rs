//! Stop handling for sessions whose in-memory runtime is gone (process
//! restart, crash cleanup). Completed sessions return their existing result
//! id; anything else gets terminal stats rebuilt from the persisted trades.

use crate::application::results::ResultFinalizer;
use crate::domain::errors::EngineError;
use crate::domain::events::EventKind;
use crate::domain::repositories::{SessionRow, SessionStatus};
use crate::domain::trading::{Trade, TradingStats};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::persistence::Repositories;
use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};

pub async fn stop_from_db(
    repos: &Repositories,
    bus: &EventBus,
    finalizer: &ResultFinalizer,
    session_id: &str,
) -> Result<String> {
    let row = repos
        .sessions
        .find_by_id(session_id)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("Session not found: {session_id}")))?;

    // Stop is idempotent: a session that already produced a result keeps
    // returning the same result id.
    if let Some(existing) = repos.results.latest_for_session(session_id).await? {
        if row.status != SessionStatus::Completed {
            repos
                .sessions
                .update_status(session_id, SessionStatus::Completed)
                .await?;
            repos
                .sessions
                .update_completed_at(session_id, Utc::now())
                .await?;
        }
        info!(
            "Session {session_id} already has result, returning existing result_id: {}",
            existing.id
        );
        return Ok(existing.id);
    }
    if row.status == SessionStatus::Completed {
        return Err(EngineError::Validation(format!(
            "Session {session_id} is already completed but no result was found"
        ))
        .into());
    }

    warn!(
        "Session {session_id} not in memory (status {}), rebuilding result from database state",
        row.status
    );
    let trades = repos.trades.list_for_session(session_id).await?;
    let stats = stats_from_trades(&trades, &row);

    repos
        .sessions
        .update_status(session_id, SessionStatus::Completed)
        .await?;
    repos
        .sessions
        .update_completed_at(session_id, Utc::now())
        .await?;

    // An equity-curve reconstruction is not attempted; it stays null.
    let result_id = finalizer
        .finalize(
            session_id,
            &stats,
            row.max_drawdown_pct.unwrap_or(0.0),
            None,
            true,
            false,
        )
        .await?;

    bus.publish(
        session_id,
        EventKind::SessionCompleted {
            session_id: session_id.to_string(),
            result_id: result_id.clone(),
            final_equity: stats.current_equity,
            total_pnl: stats.total_pnl,
            total_pnl_pct: stats.total_pnl_pct,
            total_trades: stats.total_trades,
            win_rate: stats.win_rate,
            forced_stop: true,
            auto_stop: false,
        },
    )
    .await;

    info!("Session stopped from DB state: session_id={session_id}, result_id={result_id}");
    Ok(result_id)
}

/// Rebuild terminal statistics from persisted trades plus the last flushed
/// runtime stats. Final equity comes from the runtime-stat columns; the
/// trade rows supply the gross aggregates.
pub fn stats_from_trades(trades: &[Trade], row: &SessionRow) -> TradingStats {
    let total_trades = trades.len();
    let winners: Vec<&Trade> = trades.iter().filter(|t| t.pnl > 0.0).collect();
    let losers: Vec<&Trade> = trades.iter().filter(|t| t.pnl <= 0.0).collect();

    let total_pnl: f64 = trades.iter().map(|t| t.pnl).sum();
    let gross_profit: f64 = winners.iter().map(|t| t.pnl).sum();
    let gross_loss: f64 = losers.iter().map(|t| t.pnl).sum::<f64>().abs();

    let round2 = |v: f64| (v * 100.0).round() / 100.0;

    TradingStats {
        total_trades,
        winning_trades: winners.len(),
        losing_trades: losers.len(),
        win_rate: if total_trades > 0 {
            round2(winners.len() as f64 / total_trades as f64 * 100.0)
        } else {
            0.0
        },
        total_pnl: round2(total_pnl),
        total_pnl_pct: if row.starting_capital > 0.0 {
            round2(total_pnl / row.starting_capital * 100.0)
        } else {
            0.0
        },
        average_win: if winners.is_empty() {
            0.0
        } else {
            round2(gross_profit / winners.len() as f64)
        },
        average_loss: if losers.is_empty() {
            0.0
        } else {
            round2(gross_loss / losers.len() as f64)
        },
        largest_win: round2(winners.iter().map(|t| t.pnl).fold(0.0, f64::max)),
        largest_loss: round2(losers.iter().map(|t| t.pnl).fold(0.0, f64::min)),
        profit_factor: if gross_loss > 0.0 {
            round2(gross_profit / gross_loss)
        } else {
            0.0
        },
        current_equity: round2(row.current_equity.unwrap_or(row.starting_capital)),
        equity_change_pct: round2(row.current_pnl_pct.unwrap_or(0.0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::repositories::SessionType;
    use crate::domain::trading::{CloseReason, Side};
    use uuid::Uuid;

    fn trade(pnl: f64) -> Trade {
        Trade {
            side: Side::Long,
            entry_price: 100.0,
            exit_price: 100.0 + pnl / 10.0,
            size: 10.0,
            pnl,
            pnl_pct: pnl / 10.0,
            entry_time: Utc::now(),
            exit_time: Utc::now(),
            reason: CloseReason::AiDecision,
            leverage: 1,
        }
    }

    #[test]
    fn test_stats_from_trades() {
        let mut row = SessionRow::new(
            "s",
            Uuid::new_v4(),
            SessionType::Backtest,
            "BTC/USDT",
            "1h",
            10_000.0,
        );
        row.current_equity = Some(10_050.0);
        row.current_pnl_pct = Some(0.5);

        let trades = vec![trade(100.0), trade(-50.0)];
        let stats = stats_from_trades(&trades, &row);

        assert_eq!(stats.total_trades, 2);
        assert_eq!(stats.winning_trades, 1);
        assert_eq!(stats.win_rate, 50.0);
        assert_eq!(stats.total_pnl, 50.0);
        assert_eq!(stats.total_pnl_pct, 0.5);
        assert_eq!(stats.current_equity, 10_050.0);
        assert_eq!(stats.profit_factor, 2.0);
    }

    #[test]
    fn test_stats_from_no_trades() {
        let row = SessionRow::new(
            "s",
            Uuid::new_v4(),
            SessionType::Forward,
            "BTC/USDT",
            "1h",
            10_000.0,
        );
        let stats = stats_from_trades(&[], &row);
        assert_eq!(stats.total_trades, 0);
        assert_eq!(stats.current_equity, 10_000.0);
    }
}
