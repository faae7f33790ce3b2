//! SQLite implementations of the persistence traits.

use crate::domain::agent::{AgentConfig, ApiKeyRecord};
use crate::domain::repositories::{
    AgentRepository, ApiKeyRepository, ResultRepository, ResultRow, RuntimeStatsUpdate,
    SessionRepository, SessionRow, SessionStatus, SessionType, ThoughtRecord, ThoughtRepository,
    TradeRepository,
};
use crate::domain::trading::{CloseReason, Side, Trade};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use uuid::Uuid;

fn to_epoch(at: DateTime<Utc>) -> i64 {
    at.timestamp()
}

fn from_epoch(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

pub struct SqliteAgentRepository {
    pool: SqlitePool,
}

impl SqliteAgentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AgentRepository for SqliteAgentRepository {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<AgentConfig>> {
        let row = sqlx::query("SELECT * FROM agents WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let indicators: Vec<String> =
            serde_json::from_str(&row.try_get::<String, _>("indicators")?)
                .context("Failed to parse agent indicators")?;
        let custom_indicators: Vec<serde_json::Value> = row
            .try_get::<Option<String>, _>("custom_indicators")?
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .context("Failed to parse agent custom indicators")?
            .unwrap_or_default();
        let api_key_id = row
            .try_get::<Option<String>, _>("api_key_id")?
            .map(|raw| Uuid::parse_str(&raw))
            .transpose()?;

        Ok(Some(AgentConfig {
            id: Uuid::parse_str(&row.try_get::<String, _>("id")?)?,
            name: row.try_get("name")?,
            mode: row.try_get::<String, _>("mode")?.parse()?,
            model: row.try_get("model")?,
            strategy_prompt: row.try_get("strategy_prompt")?,
            indicators,
            custom_indicators,
            api_key_id,
        }))
    }

    async fn save(&self, agent: &AgentConfig) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO agents (id, name, mode, model, strategy_prompt, indicators, custom_indicators, api_key_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                mode = excluded.mode,
                model = excluded.model,
                strategy_prompt = excluded.strategy_prompt,
                indicators = excluded.indicators,
                custom_indicators = excluded.custom_indicators,
                api_key_id = excluded.api_key_id
            "#,
        )
        .bind(agent.id.to_string())
        .bind(&agent.name)
        .bind(agent.mode.to_string())
        .bind(&agent.model)
        .bind(&agent.strategy_prompt)
        .bind(serde_json::to_string(&agent.indicators)?)
        .bind(serde_json::to_string(&agent.custom_indicators)?)
        .bind(agent.api_key_id.map(|id| id.to_string()))
        .execute(&self.pool)
        .await
        .context("Failed to save agent")?;
        Ok(())
    }
}

pub struct SqliteApiKeyRepository {
    pool: SqlitePool,
}

impl SqliteApiKeyRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ApiKeyRepository for SqliteApiKeyRepository {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<ApiKeyRecord>> {
        let row = sqlx::query("SELECT * FROM api_keys WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| {
            Ok(ApiKeyRecord {
                id: Uuid::parse_str(&row.try_get::<String, _>("id")?)?,
                encrypted_key: row.try_get("encrypted_key")?,
                key_prefix: row.try_get("key_prefix")?,
            })
        })
        .transpose()
    }

    async fn save(&self, key: &ApiKeyRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO api_keys (id, encrypted_key, key_prefix)
            VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                encrypted_key = excluded.encrypted_key,
                key_prefix = excluded.key_prefix
            "#,
        )
        .bind(key.id.to_string())
        .bind(&key.encrypted_key)
        .bind(&key.key_prefix)
        .execute(&self.pool)
        .await
        .context("Failed to save api key")?;
        Ok(())
    }
}

pub struct SqliteSessionRepository {
    pool: SqlitePool,
}

impl SqliteSessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionRepository for SqliteSessionRepository {
    async fn create(&self, row: &SessionRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO test_sessions (
                id, agent_id, session_type, status, asset, timeframe,
                starting_capital, total_candles, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.id)
        .bind(row.agent_id.to_string())
        .bind(row.session_type.to_string())
        .bind(row.status.to_string())
        .bind(&row.asset)
        .bind(&row.timeframe)
        .bind(row.starting_capital)
        .bind(row.total_candles)
        .bind(to_epoch(row.created_at))
        .execute(&self.pool)
        .await
        .context("Failed to create session row")?;
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<SessionRow>> {
        let row = sqlx::query("SELECT * FROM test_sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let open_position = row
            .try_get::<Option<String>, _>("open_position")?
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .unwrap_or(None);

        Ok(Some(SessionRow {
            id: row.try_get("id")?,
            agent_id: Uuid::parse_str(&row.try_get::<String, _>("agent_id")?)?,
            session_type: SessionType::from_str(&row.try_get::<String, _>("session_type")?)?,
            status: SessionStatus::from_str(&row.try_get::<String, _>("status")?)?,
            asset: row.try_get("asset")?,
            timeframe: row.try_get("timeframe")?,
            starting_capital: row.try_get("starting_capital")?,
            current_equity: row.try_get("current_equity")?,
            current_pnl_pct: row.try_get("current_pnl_pct")?,
            max_drawdown_pct: row.try_get("max_drawdown_pct")?,
            elapsed_seconds: row.try_get("elapsed_seconds")?,
            current_candle: row.try_get("current_candle")?,
            total_candles: row.try_get("total_candles")?,
            open_position,
            created_at: from_epoch(row.try_get("created_at")?),
            started_at: row.try_get::<Option<i64>, _>("started_at")?.map(from_epoch),
            paused_at: row.try_get::<Option<i64>, _>("paused_at")?.map(from_epoch),
            completed_at: row
                .try_get::<Option<i64>, _>("completed_at")?
                .map(from_epoch),
        }))
    }

    async fn update_status(&self, id: &str, status: SessionStatus) -> Result<()> {
        sqlx::query("UPDATE test_sessions SET status = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to update session status")?;
        Ok(())
    }

    async fn update_started_at(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE test_sessions SET started_at = ? WHERE id = ?")
            .bind(to_epoch(at))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_paused_at(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE test_sessions SET paused_at = ? WHERE id = ?")
            .bind(to_epoch(at))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_completed_at(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE test_sessions SET completed_at = ? WHERE id = ?")
            .bind(to_epoch(at))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_total_candles(&self, id: &str, total: i64) -> Result<()> {
        sqlx::query("UPDATE test_sessions SET total_candles = ? WHERE id = ?")
            .bind(total)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_current_candle(&self, id: &str, index: i64) -> Result<()> {
        sqlx::query("UPDATE test_sessions SET current_candle = ? WHERE id = ?")
            .bind(index)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_runtime_stats(&self, id: &str, stats: &RuntimeStatsUpdate) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE test_sessions SET
                current_equity = ?,
                current_pnl_pct = ?,
                max_drawdown_pct = ?,
                elapsed_seconds = ?,
                open_position = ?,
                current_candle = ?
            WHERE id = ?
            "#,
        )
        .bind(stats.current_equity)
        .bind(stats.current_pnl_pct)
        .bind(stats.max_drawdown_pct)
        .bind(stats.elapsed_seconds)
        .bind(
            stats
                .open_position
                .as_ref()
                .map(|p| serde_json::to_string(p).unwrap_or_default()),
        )
        .bind(stats.current_candle)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to update runtime stats")?;
        Ok(())
    }
}

pub struct SqliteTradeRepository {
    pool: SqlitePool,
}

impl SqliteTradeRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TradeRepository for SqliteTradeRepository {
    async fn append(&self, session_id: &str, trade_number: i64, trade: &Trade) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trades (
                session_id, trade_number, side, entry_price, exit_price, size,
                pnl, pnl_pct, entry_time, exit_time, reason, leverage
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(session_id)
        .bind(trade_number)
        .bind(trade.side.to_string())
        .bind(trade.entry_price)
        .bind(trade.exit_price)
        .bind(trade.size)
        .bind(trade.pnl)
        .bind(trade.pnl_pct)
        .bind(to_epoch(trade.entry_time))
        .bind(to_epoch(trade.exit_time))
        .bind(trade.reason.to_string())
        .bind(trade.leverage as i64)
        .execute(&self.pool)
        .await
        .context("Failed to append trade")?;
        Ok(())
    }

    async fn list_for_session(&self, session_id: &str) -> Result<Vec<Trade>> {
        let rows = sqlx::query("SELECT * FROM trades WHERE session_id = ? ORDER BY trade_number")
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?;

        let mut trades = Vec::with_capacity(rows.len());
        for row in rows {
            trades.push(Trade {
                side: Side::from_str(&row.try_get::<String, _>("side")?)?,
                entry_price: row.try_get("entry_price")?,
                exit_price: row.try_get("exit_price")?,
                size: row.try_get("size")?,
                pnl: row.try_get("pnl")?,
                pnl_pct: row.try_get("pnl_pct")?,
                entry_time: from_epoch(row.try_get("entry_time")?),
                exit_time: from_epoch(row.try_get("exit_time")?),
                reason: CloseReason::from_str(&row.try_get::<String, _>("reason")?)?,
                leverage: row.try_get::<i64, _>("leverage")? as u8,
            });
        }
        Ok(trades)
    }
}

pub struct SqliteThoughtRepository {
    pool: SqlitePool,
}

impl SqliteThoughtRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ThoughtRepository for SqliteThoughtRepository {
    async fn append_all(&self, session_id: &str, thoughts: &[ThoughtRecord]) -> Result<()> {
        for thought in thoughts {
            sqlx::query(
                r#"
                INSERT INTO ai_thoughts (
                    session_id, candle_number, timestamp, candle, indicators,
                    reasoning, decision, order_data, council
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(session_id)
            .bind(thought.candle_number)
            .bind(to_epoch(thought.timestamp))
            .bind(serde_json::to_string(&thought.candle)?)
            .bind(serde_json::to_string(&thought.indicators)?)
            .bind(&thought.reasoning)
            .bind(&thought.decision)
            .bind(
                thought
                    .order_data
                    .as_ref()
                    .map(|v| serde_json::to_string(v).unwrap_or_default()),
            )
            .bind(
                thought
                    .council
                    .as_ref()
                    .map(|v| serde_json::to_string(v).unwrap_or_default()),
            )
            .execute(&self.pool)
            .await
            .context("Failed to append ai thought")?;
        }
        Ok(())
    }
}

pub struct SqliteResultRepository {
    pool: SqlitePool,
}

impl SqliteResultRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ResultRepository for SqliteResultRepository {
    async fn insert(&self, row: &ResultRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO test_results (
                id, session_id, final_equity, total_pnl, total_pnl_pct,
                total_trades, winning_trades, losing_trades, win_rate,
                profit_factor, largest_win, largest_loss, max_drawdown_pct,
                equity_curve, forced_stop, auto_stop, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.id)
        .bind(&row.session_id)
        .bind(row.final_equity)
        .bind(row.total_pnl)
        .bind(row.total_pnl_pct)
        .bind(row.total_trades)
        .bind(row.winning_trades)
        .bind(row.losing_trades)
        .bind(row.win_rate)
        .bind(row.profit_factor)
        .bind(row.largest_win)
        .bind(row.largest_loss)
        .bind(row.max_drawdown_pct)
        .bind(
            row.equity_curve
                .as_ref()
                .map(|v| serde_json::to_string(v).unwrap_or_default()),
        )
        .bind(row.forced_stop as i64)
        .bind(row.auto_stop as i64)
        .bind(to_epoch(row.created_at))
        .execute(&self.pool)
        .await
        .context("Failed to insert test result")?;
        Ok(())
    }

    async fn latest_for_session(&self, session_id: &str) -> Result<Option<ResultRow>> {
        let row = sqlx::query(
            "SELECT * FROM test_results WHERE session_id = ? ORDER BY created_at DESC, rowid DESC LIMIT 1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let equity_curve = row
            .try_get::<Option<String>, _>("equity_curve")?
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .unwrap_or(None);

        Ok(Some(ResultRow {
            id: row.try_get("id")?,
            session_id: row.try_get("session_id")?,
            final_equity: row.try_get("final_equity")?,
            total_pnl: row.try_get("total_pnl")?,
            total_pnl_pct: row.try_get("total_pnl_pct")?,
            total_trades: row.try_get("total_trades")?,
            winning_trades: row.try_get("winning_trades")?,
            losing_trades: row.try_get("losing_trades")?,
            win_rate: row.try_get("win_rate")?,
            profit_factor: row.try_get("profit_factor")?,
            largest_win: row.try_get("largest_win")?,
            largest_loss: row.try_get("largest_loss")?,
            max_drawdown_pct: row.try_get("max_drawdown_pct")?,
            equity_curve,
            forced_stop: row.try_get::<i64, _>("forced_stop")? != 0,
            auto_stop: row.try_get::<i64, _>("auto_stop")? != 0,
            created_at: from_epoch(row.try_get("created_at")?),
        }))
    }
}

