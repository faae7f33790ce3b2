use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Direction of a simulated position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Long => write!(f, "long"),
            Side::Short => write!(f, "short"),
        }
    }
}

impl FromStr for Side {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "long" => Ok(Side::Long),
            "short" => Ok(Side::Short),
            _ => Err(anyhow!("Invalid position side: '{}'", s)),
        }
    }
}

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    StopLoss,
    TakeProfit,
    AiDecision,
    Manual,
    AutoStop,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::StopLoss => "stop_loss",
            CloseReason::TakeProfit => "take_profit",
            CloseReason::AiDecision => "ai_decision",
            CloseReason::Manual => "manual",
            CloseReason::AutoStop => "auto_stop",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for CloseReason {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stop_loss" => Ok(CloseReason::StopLoss),
            "take_profit" => Ok(CloseReason::TakeProfit),
            "ai_decision" => Ok(CloseReason::AiDecision),
            "manual" => Ok(CloseReason::Manual),
            "auto_stop" => Ok(CloseReason::AutoStop),
            _ => Err(anyhow!("Invalid close reason: '{}'", s)),
        }
    }
}

/// An open simulated position. At most one exists per session at any time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub side: Side,
    pub entry_price: f64,
    /// Size in base-asset units.
    pub size: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub entry_time: DateTime<Utc>,
    pub leverage: u8,
    pub unrealized_pnl: f64,
}

impl Position {
    /// Margin committed to the position: notional divided by leverage.
    pub fn margin(&self) -> f64 {
        (self.entry_price * self.size) / self.leverage as f64
    }

    /// Notional value at entry.
    pub fn notional(&self) -> f64 {
        self.entry_price * self.size
    }
}

/// A closed position. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub side: Side,
    pub entry_price: f64,
    pub exit_price: f64,
    pub size: f64,
    /// Absolute realized PnL.
    pub pnl: f64,
    /// Realized PnL as a percentage of the committed margin.
    pub pnl_pct: f64,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub reason: CloseReason,
    pub leverage: u8,
}

/// A decision with an explicit entry price that has not filled yet.
///
/// Owned by the session runtime, not the position manager; it fills on the
/// first later candle whose range brackets the entry price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOrder {
    pub side: Side,
    pub entry_price: f64,
    pub size_pct: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub leverage: u8,
    pub reasoning: String,
    pub decision_candle: Option<usize>,
}

/// Aggregate trading statistics, rounded to 2 decimals at this boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingStats {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub total_pnl: f64,
    pub total_pnl_pct: f64,
    pub average_win: f64,
    pub average_loss: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    pub profit_factor: f64,
    pub current_equity: f64,
    pub equity_change_pct: f64,
}
