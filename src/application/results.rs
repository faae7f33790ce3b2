//! Terminal result aggregation.
//!
//! Every terminal path (completion, manual stop, auto-stop, stop from
//! database-only state) funnels through here, so a finished session always
//! has a real persisted result row and id.

use crate::domain::repositories::{ResultRepository, ResultRow};
use crate::domain::trading::TradingStats;
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

pub struct ResultFinalizer {
    results: Arc<dyn ResultRepository>,
}

impl ResultFinalizer {
    pub fn new(results: Arc<dyn ResultRepository>) -> Self {
        Self { results }
    }

    pub async fn finalize(
        &self,
        session_id: &str,
        stats: &TradingStats,
        max_drawdown_pct: f64,
        equity_curve: Option<serde_json::Value>,
        forced_stop: bool,
        auto_stop: bool,
    ) -> Result<String> {
        let row = ResultRow {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            final_equity: stats.current_equity,
            total_pnl: stats.total_pnl,
            total_pnl_pct: stats.total_pnl_pct,
            total_trades: stats.total_trades as i64,
            winning_trades: stats.winning_trades as i64,
            losing_trades: stats.losing_trades as i64,
            win_rate: stats.win_rate,
            profit_factor: stats.profit_factor,
            largest_win: stats.largest_win,
            largest_loss: stats.largest_loss,
            max_drawdown_pct,
            equity_curve,
            forced_stop,
            auto_stop,
            created_at: Utc::now(),
        };
        self.results.insert(&row).await?;
        info!(
            "Result persisted: session_id={}, result_id={}, pnl={}%",
            session_id, row.id, stats.total_pnl_pct
        );
        Ok(row.id)
    }
}
