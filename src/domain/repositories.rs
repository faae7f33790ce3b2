use crate::domain::agent::{AgentConfig, ApiKeyRecord};
use crate::domain::events::IndicatorMap;
use crate::domain::market::Candle;
use crate::domain::trading::Trade;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle status of a test session.
///
/// `configuring -> initializing -> running <-> paused -> completed`, with
/// `failed` and `stopped` as alternate terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Configuring,
    Initializing,
    Running,
    Paused,
    Completed,
    Failed,
    Stopped,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Stopped
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Configuring => "configuring",
            SessionStatus::Initializing => "initializing",
            SessionStatus::Running => "running",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for SessionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "configuring" => Ok(SessionStatus::Configuring),
            "initializing" => Ok(SessionStatus::Initializing),
            "running" => Ok(SessionStatus::Running),
            "paused" => Ok(SessionStatus::Paused),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            "stopped" => Ok(SessionStatus::Stopped),
            _ => Err(anyhow!("Invalid session status: '{}'", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    Backtest,
    Forward,
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionType::Backtest => write!(f, "backtest"),
            SessionType::Forward => write!(f, "forward"),
        }
    }
}

impl FromStr for SessionType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "backtest" => Ok(SessionType::Backtest),
            "forward" => Ok(SessionType::Forward),
            _ => Err(anyhow!("Invalid session type: '{}'", s)),
        }
    }
}

/// Persisted shape of a test session.
#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: String,
    pub agent_id: Uuid,
    pub session_type: SessionType,
    pub status: SessionStatus,
    pub asset: String,
    pub timeframe: String,
    pub starting_capital: f64,
    pub current_equity: Option<f64>,
    pub current_pnl_pct: Option<f64>,
    pub max_drawdown_pct: Option<f64>,
    pub elapsed_seconds: Option<i64>,
    pub current_candle: Option<i64>,
    pub total_candles: Option<i64>,
    /// JSON snapshot of the open position, if any.
    pub open_position: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SessionRow {
    pub fn new(
        id: impl Into<String>,
        agent_id: Uuid,
        session_type: SessionType,
        asset: impl Into<String>,
        timeframe: impl Into<String>,
        starting_capital: f64,
    ) -> Self {
        Self {
            id: id.into(),
            agent_id,
            session_type,
            status: SessionStatus::Configuring,
            asset: asset.into(),
            timeframe: timeframe.into(),
            starting_capital,
            current_equity: None,
            current_pnl_pct: None,
            max_drawdown_pct: None,
            elapsed_seconds: None,
            current_candle: None,
            total_candles: None,
            open_position: None,
            created_at: Utc::now(),
            started_at: None,
            paused_at: None,
            completed_at: None,
        }
    }
}

/// Batched runtime statistics flushed while a session runs.
#[derive(Debug, Clone)]
pub struct RuntimeStatsUpdate {
    pub current_equity: f64,
    pub current_pnl_pct: f64,
    pub max_drawdown_pct: f64,
    pub elapsed_seconds: i64,
    pub open_position: Option<serde_json::Value>,
    pub current_candle: i64,
}

/// One decision-journal entry: the full context the agent saw plus what it
/// decided, persisted at finalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThoughtRecord {
    pub candle_number: i64,
    pub timestamp: DateTime<Utc>,
    pub candle: Candle,
    pub indicators: IndicatorMap,
    pub reasoning: String,
    pub decision: String,
    /// Entry/SL/TP/size/leverage payload, present only for LONG/SHORT.
    pub order_data: Option<serde_json::Value>,
    /// Council deliberation transcript, when council mode is active.
    pub council: Option<serde_json::Value>,
}

/// Persisted terminal result of a session.
#[derive(Debug, Clone)]
pub struct ResultRow {
    pub id: String,
    pub session_id: String,
    pub final_equity: f64,
    pub total_pnl: f64,
    pub total_pnl_pct: f64,
    pub total_trades: i64,
    pub winning_trades: i64,
    pub losing_trades: i64,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    pub max_drawdown_pct: f64,
    /// Sampled equity curve; NULL when rebuilt from database-only state.
    pub equity_curve: Option<serde_json::Value>,
    pub forced_stop: bool,
    pub auto_stop: bool,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait AgentRepository: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<AgentConfig>>;
    async fn save(&self, agent: &AgentConfig) -> Result<()>;
}

#[async_trait]
pub trait ApiKeyRepository: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<ApiKeyRecord>>;
    async fn save(&self, key: &ApiKeyRecord) -> Result<()>;
}

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn create(&self, row: &SessionRow) -> Result<()>;
    async fn find_by_id(&self, id: &str) -> Result<Option<SessionRow>>;
    async fn update_status(&self, id: &str, status: SessionStatus) -> Result<()>;
    async fn update_started_at(&self, id: &str, at: DateTime<Utc>) -> Result<()>;
    async fn update_paused_at(&self, id: &str, at: DateTime<Utc>) -> Result<()>;
    async fn update_completed_at(&self, id: &str, at: DateTime<Utc>) -> Result<()>;
    async fn update_total_candles(&self, id: &str, total: i64) -> Result<()>;
    async fn update_current_candle(&self, id: &str, index: i64) -> Result<()>;
    async fn update_runtime_stats(&self, id: &str, stats: &RuntimeStatsUpdate) -> Result<()>;
}

#[async_trait]
pub trait TradeRepository: Send + Sync {
    async fn append(&self, session_id: &str, trade_number: i64, trade: &Trade) -> Result<()>;
    async fn list_for_session(&self, session_id: &str) -> Result<Vec<Trade>>;
}

#[async_trait]
pub trait ThoughtRepository: Send + Sync {
    async fn append_all(&self, session_id: &str, thoughts: &[ThoughtRecord]) -> Result<()>;
}

#[async_trait]
pub trait ResultRepository: Send + Sync {
    async fn insert(&self, row: &ResultRow) -> Result<()>;
    async fn latest_for_session(&self, session_id: &str) -> Result<Option<ResultRow>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            SessionStatus::Configuring,
            SessionStatus::Initializing,
            SessionStatus::Running,
            SessionStatus::Paused,
            SessionStatus::Completed,
            SessionStatus::Failed,
            SessionStatus::Stopped,
        ] {
            assert_eq!(SessionStatus::from_str(&status.to_string()).unwrap(), status);
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Failed.is_terminal());
        assert!(SessionStatus::Stopped.is_terminal());
        assert!(!SessionStatus::Running.is_terminal());
        assert!(!SessionStatus::Paused.is_terminal());
    }
}
